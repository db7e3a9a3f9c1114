//! Strongly-typed loop time and the clocks that produce it.

use core::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable name for logs.
    const NAME: &'static str;
}

#[derive(Debug)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
}

/// Span of time in a given unit.
#[derive(Debug)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Point on an instance's loop clock in a given unit.
#[derive(Debug)]
#[repr(transparent)]
pub struct Timestamp<U: TimeUnit>(u64, PhantomData<U>);

// Manual impls: derive would put bounds on the uninhabited unit marker.
macro_rules! impl_value_traits {
    ($($ty:ident),*) => {$(
        impl<U: TimeUnit> Clone for $ty<U> {
            fn clone(&self) -> Self {
                *self
            }
        }
        impl<U: TimeUnit> Copy for $ty<U> {}
        impl<U: TimeUnit> PartialEq for $ty<U> {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }
        impl<U: TimeUnit> Eq for $ty<U> {}
        impl<U: TimeUnit> PartialOrd for $ty<U> {
            fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl<U: TimeUnit> Ord for $ty<U> {
            fn cmp(&self, other: &Self) -> core::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }
        impl<U: TimeUnit> core::fmt::Display for $ty<U> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}{}", self.0, U::NAME)
            }
        }
    )*};
}

impl_value_traits!(Duration, Timestamp);

impl<U: TimeUnit> Duration<U> {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Multiplies by a count, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn saturating_mul(self, count: u64) -> Self {
        Self::new(self.0.saturating_mul(count))
    }

    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self::new(self.0.saturating_add(rhs.0))
    }
}

impl Duration<Millis> {
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value)
    }

    /// Converts to a std duration for APIs such as `mio::Poll::poll`.
    #[inline]
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }
}

impl<U: TimeUnit> Timestamp<U> {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0.saturating_add(rhs.0))
    }
}

/// Source of loop time for one instance.
pub trait Clock {
    fn now(&self) -> Timestamp<Millis>;
}

/// Wall-independent monotonic clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: minstant::Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: minstant::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp<Millis> {
        let elapsed = self.origin.elapsed().as_millis();
        Timestamp::new(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

/// Clock advanced by hand; clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.now.store(value, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration<Millis>) {
        self.now.fetch_add(by.as_u64(), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp<Millis> {
        Timestamp::new(self.now.load(Ordering::Relaxed))
    }
}
