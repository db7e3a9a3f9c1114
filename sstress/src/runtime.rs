//! Per-instance runtime.
//!
//! - `timing`: loop time and the timing wheel (shared-nothing, per-thread).
//! - `instance`: the cooperative event loop owning one instance's state.
//! - `fanout`: starts N isolated instances as processes or threads.

pub mod fanout;
pub mod instance;
pub mod timing;

use crate::transport::StreamId;

/// Wheel size; one slot per millisecond of a rotation.
pub const WHEEL_SLOTS: usize = 1024;

/// Timers live at once: the watchdog, one attempt timeout and the probe.
pub const WHEEL_CAPACITY: usize = 16;

/// Everything an instance schedules on its wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    AttemptTimeout(StreamId),
    ProbeTimeout,
    Watchdog,
}

pub type Timers = timing::TimerWheel<TimerEvent, WHEEL_SLOTS>;
