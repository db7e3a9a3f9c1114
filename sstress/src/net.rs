//! Network primitives for the HTTP transport.
//!
//! Thin mio-based TCP plumbing; protocol handling lives in `transport`.

pub mod endpoint;
pub mod resolver;
pub mod stream;

pub use endpoint::Endpoint;
pub use resolver::Resolver;
pub use stream::{ConnectStatus, TcpStream};
