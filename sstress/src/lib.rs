//! Stress harness for policy-configured streams.
//!
//! An instance brings a system context up through its lifecycle stages,
//! checks connectivity, then drives streams of one type through
//! connect/transfer/disconnect cycles until its retry budget is spent. The
//! outcome aggregator turns what was observed into a verdict compared against
//! the expected indicator. A watchdog bounds every run; the fan-out starts N
//! isolated instances.

pub mod config;
pub mod controller;
pub mod gate;
pub mod net;
pub mod outcome;
pub mod policy;
pub mod runtime;
pub mod system;
pub mod trace;
pub mod transport;
pub mod watchdog;

pub use config::{ConfigError, HarnessArgs, HarnessConfig};
pub use outcome::Verdict;
pub use runtime::fanout::FanoutError;
pub use runtime::instance::{InstanceError, InstanceExit, InstanceReport, InstanceSpec};
