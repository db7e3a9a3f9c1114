//! Timing primitives for the instance loop.
//!
//! One wheel per instance, driven by that instance's loop thread only.

mod slab;
mod time;
mod wheel;

pub use time::{Clock, Duration, ManualClock, Millis, MonotonicClock, TimeUnit, Timestamp};
pub use wheel::{TimerHandle, TimerWheel, WheelError};
