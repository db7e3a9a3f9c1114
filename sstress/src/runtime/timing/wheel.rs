//! Hashed timing wheel with generational handles.
//!
//! Single level, power-of-two slots, one tick per millisecond of loop time.
//! Entries remember their absolute deadline, so delays longer than one
//! rotation simply stay in their slot until a visit finds them due. Fired
//! timers are delivered in deadline order.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

use thiserror::Error;

use super::slab::{Slab, SlabKey};
use super::time::{Duration, Millis, Timestamp};

/// Handle to a scheduled timer; stale once the timer fires or is cancelled.
pub struct TimerHandle<T> {
    key: SlabKey,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TimerHandle<T> {}

impl<T> PartialEq for TimerHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for TimerHandle<T> {}

impl<T> core::fmt::Debug for TimerHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TimerHandle({}#{})", self.key.index, self.key.generation)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("timing wheel is at capacity")]
    Capacity,
}

pub struct TimerWheel<T, const SLOTS: usize> {
    slots: Vec<Vec<SlabKey>>,
    slab: Slab<T>,
    /// Last tick that has been processed.
    cursor: u64,
}

impl<T, const SLOTS: usize> TimerWheel<T, SLOTS> {
    const MASK: u64 = {
        assert!(SLOTS.is_power_of_two(), "SLOTS must be a power of two");
        SLOTS as u64 - 1
    };

    /// Creates an empty wheel whose cursor sits at `start`.
    #[must_use]
    pub fn new(capacity: NonZeroUsize, start: Timestamp<Millis>) -> Self {
        let _ = Self::MASK;
        Self {
            slots: (0..SLOTS).map(|_| Vec::new()).collect(),
            slab: Slab::with_capacity(capacity),
            cursor: start.as_u64(),
        }
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `payload` at an absolute deadline.
    ///
    /// Deadlines at or behind the cursor fire on the next advance.
    pub fn schedule_at(
        &mut self,
        deadline: Timestamp<Millis>,
        payload: T,
    ) -> Result<TimerHandle<T>, WheelError> {
        let deadline = deadline.as_u64().max(self.cursor + 1);
        let key = self
            .slab
            .insert(payload, deadline)
            .ok_or(WheelError::Capacity)?;
        self.slots[(deadline & Self::MASK) as usize].push(key);
        Ok(TimerHandle {
            key,
            _payload: PhantomData,
        })
    }

    pub fn schedule_after(
        &mut self,
        now: Timestamp<Millis>,
        delay: Duration<Millis>,
        payload: T,
    ) -> Result<TimerHandle<T>, WheelError> {
        self.schedule_at(now + delay, payload)
    }

    /// Cancels a pending timer. Returns `false` for fired or cancelled handles.
    pub fn cancel(&mut self, handle: &TimerHandle<T>) -> bool {
        let Some(deadline) = self.slab.deadline(handle.key) else {
            return false;
        };
        let slot = &mut self.slots[(deadline & Self::MASK) as usize];
        slot.retain(|k| *k != handle.key);
        self.slab.remove(handle.key).is_some()
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp<Millis>> {
        self.slab.min_deadline().map(Timestamp::new)
    }

    /// Advances to `now`, handing each due timer to `on_fire` in deadline order.
    pub fn advance(&mut self, now: Timestamp<Millis>, mut on_fire: impl FnMut(TimerHandle<T>, T)) {
        let now = now.as_u64();
        if now <= self.cursor {
            return;
        }
        // Nothing can fire before the earliest deadline; skip the empty span.
        let mut tick = match self.slab.min_deadline() {
            Some(min) if min <= now => min.max(self.cursor + 1),
            _ => {
                self.cursor = now;
                return;
            }
        };
        while tick <= now {
            let slot = (tick & Self::MASK) as usize;
            let mut i = 0;
            while i < self.slots[slot].len() {
                let key = self.slots[slot][i];
                match self.slab.deadline(key) {
                    Some(deadline) if deadline <= tick => {
                        self.slots[slot].swap_remove(i);
                        if let Some(payload) = self.slab.remove(key) {
                            on_fire(
                                TimerHandle {
                                    key,
                                    _payload: PhantomData,
                                },
                                payload,
                            );
                        }
                    }
                    Some(_) => i += 1,
                    None => {
                        self.slots[slot].swap_remove(i);
                    }
                }
            }
            self.cursor = tick;
            match self.slab.min_deadline() {
                Some(min) if min <= now => tick = min.max(tick + 1),
                _ => break,
            }
        }
        self.cursor = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel(capacity: usize) -> TimerWheel<u32, 8> {
        TimerWheel::new(NonZeroUsize::new(capacity).unwrap(), Timestamp::new(0))
    }

    fn ms(v: u64) -> Timestamp<Millis> {
        Timestamp::new(v)
    }

    #[test]
    fn zero_delay_fires_on_next_advance() {
        let mut w = wheel(4);
        let h = w.schedule_after(ms(0), Duration::ZERO, 7).unwrap();
        let mut fired = Vec::new();
        w.advance(ms(0), |h, v| fired.push((h, v)));
        assert!(fired.is_empty(), "no advance, no fire");
        w.advance(ms(1), |h, v| fired.push((h, v)));
        assert_eq!(fired, vec![(h, 7)]);
        assert!(!w.cancel(&h), "handle is stale after firing");
    }

    #[test]
    fn cancel_prevents_fire_and_is_not_repeatable() {
        let mut w = wheel(2);
        let h = w.schedule_after(ms(0), Duration::from_millis(3), 42).unwrap();
        assert!(w.cancel(&h));
        assert!(!w.cancel(&h));
        let mut fired = Vec::new();
        w.advance(ms(10), |_, v| fired.push(v));
        assert!(fired.is_empty());
        assert!(w.is_empty());
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let mut w = wheel(1);
        w.schedule_after(ms(0), Duration::from_millis(1), 1).unwrap();
        assert_eq!(
            w.schedule_after(ms(0), Duration::from_millis(1), 2),
            Err(WheelError::Capacity)
        );
    }

    #[test]
    fn delays_beyond_one_rotation_wait_for_their_deadline() {
        let mut w = wheel(4);
        // 8 slots; 20ms wraps the wheel twice.
        w.schedule_after(ms(0), Duration::from_millis(20), 20).unwrap();
        let mut fired = Vec::new();
        w.advance(ms(19), |_, v| fired.push(v));
        assert!(fired.is_empty(), "not due before 20ms");
        w.advance(ms(20), |_, v| fired.push(v));
        assert_eq!(fired, vec![20]);
    }

    #[test]
    fn jump_ahead_fires_in_deadline_order() {
        let mut w = wheel(4);
        w.schedule_at(ms(30), 30).unwrap();
        w.schedule_at(ms(2), 2).unwrap();
        w.schedule_at(ms(11), 11).unwrap();
        let mut fired = Vec::new();
        w.advance(ms(100), |_, v| fired.push(v));
        assert_eq!(fired, vec![2, 11, 30]);
    }

    #[test]
    fn next_deadline_reports_earliest_live_timer() {
        let mut w = wheel(4);
        assert_eq!(w.next_deadline(), None);
        let early = w.schedule_at(ms(5), 5).unwrap();
        w.schedule_at(ms(9), 9).unwrap();
        assert_eq!(w.next_deadline(), Some(ms(5)));
        w.cancel(&early);
        assert_eq!(w.next_deadline(), Some(ms(9)));
    }

    #[test]
    fn past_deadline_is_clamped_to_next_tick() {
        let mut w = wheel(2);
        w.advance(ms(50), |_, _| {});
        w.schedule_at(ms(10), 1).unwrap();
        assert_eq!(w.next_deadline(), Some(ms(51)));
    }
}
