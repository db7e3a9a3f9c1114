//! Per-instance system services: lifecycle stages, blob store and the
//! connectivity probe.

pub mod blob;
pub mod probe;
pub mod state;

pub use blob::{AUTH_IDX_ROOT, BlobKind, BlobStore};
pub use probe::{ConnectivityProbe, ProbeVerdict};
pub use state::{StageTransition, StateManager, SystemState};
