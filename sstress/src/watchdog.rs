//! Single-shot process deadline.
//!
//! Armed once at startup for budget × per-attempt timeout (plus grace).
//! Expiry is fatal for the instance. Every clean shutdown path cancels it;
//! a cancel after the expiry has been dequeued does nothing.

use crate::runtime::timing::{Duration, Millis, Timestamp, TimerHandle, WheelError};
use crate::runtime::{TimerEvent, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchdogState {
    Idle,
    Armed(TimerHandle<TimerEvent>),
    Fired,
    Cancelled,
}

#[derive(Debug)]
pub struct Watchdog {
    state: WatchdogState,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: WatchdogState::Idle,
        }
    }

    /// Arms the deadline `after` from `now`. Only the first call has effect.
    ///
    /// # Errors
    ///
    /// Returns [`WheelError::Capacity`] if the wheel is full.
    pub fn schedule(
        &mut self,
        timers: &mut Timers,
        now: Timestamp<Millis>,
        after: Duration<Millis>,
    ) -> Result<(), WheelError> {
        if self.state != WatchdogState::Idle {
            return Ok(());
        }
        let handle = timers.schedule_after(now, after, TimerEvent::Watchdog)?;
        self.state = WatchdogState::Armed(handle);
        Ok(())
    }

    /// Cancels a pending deadline. Returns `true` only if it was still armed.
    pub fn cancel(&mut self, timers: &mut Timers) -> bool {
        match self.state {
            WatchdogState::Armed(handle) => {
                timers.cancel(&handle);
                self.state = WatchdogState::Cancelled;
                true
            }
            WatchdogState::Idle | WatchdogState::Fired | WatchdogState::Cancelled => false,
        }
    }

    /// Accepts a dequeued expiry. Returns `true` if the watchdog was live.
    pub fn on_fire(&mut self) -> bool {
        if matches!(self.state, WatchdogState::Armed(_)) {
            self.state = WatchdogState::Fired;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state == WatchdogState::Fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::WHEEL_CAPACITY;
    use crate::runtime::timing::{Clock, ManualClock};
    use core::num::NonZeroUsize;

    fn timers(clock: &ManualClock) -> Timers {
        Timers::new(NonZeroUsize::new(WHEEL_CAPACITY).unwrap(), clock.now())
    }

    #[test]
    fn fires_once_at_deadline() {
        let clock = ManualClock::new();
        let mut wheel = timers(&clock);
        let mut dog = Watchdog::new();
        dog.schedule(&mut wheel, clock.now(), Duration::from_millis(300))
            .unwrap();
        // A second schedule must not move or duplicate the deadline.
        dog.schedule(&mut wheel, clock.now(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(wheel.len(), 1);

        clock.advance(Duration::from_millis(299));
        let mut fired = Vec::new();
        wheel.advance(clock.now(), |_, e| fired.push(e));
        assert!(fired.is_empty());

        clock.advance(Duration::from_millis(1));
        wheel.advance(clock.now(), |_, e| fired.push(e));
        assert_eq!(fired, vec![TimerEvent::Watchdog]);
        assert!(dog.on_fire());
        assert!(dog.has_fired());
        assert!(!dog.cancel(&mut wheel), "cancel after expiry has no effect");
    }

    #[test]
    fn cancel_is_effective_exactly_once() {
        let clock = ManualClock::new();
        let mut wheel = timers(&clock);
        let mut dog = Watchdog::new();
        dog.schedule(&mut wheel, clock.now(), Duration::from_millis(5))
            .unwrap();
        assert!(dog.cancel(&mut wheel));
        assert!(!dog.cancel(&mut wheel));
        clock.advance(Duration::from_millis(50));
        let mut fired = 0;
        wheel.advance(clock.now(), |_, _| fired += 1);
        assert_eq!(fired, 0);
        assert!(!dog.on_fire());
    }
}
