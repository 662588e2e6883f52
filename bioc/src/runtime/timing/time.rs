//! Strongly-typed time units, durations and monotonic instants.
//!
//! The wheel never reads a live clock on its own: the owning loop samples a
//! [`Clock`] once per wake and every timer is evaluated against that sample.

use core::marker::PhantomData;
use core::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable suffix for logs.
    const NAME: &'static str;
}

#[derive(Debug)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
}

/// Strongly-typed span in a given unit.
#[derive(Debug)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Strongly-typed monotonic point in a given unit.
#[derive(Debug)]
#[repr(transparent)]
pub struct MonoInstant<U: TimeUnit>(u64, PhantomData<U>);

/// A span that is statically known to be non-zero, used for tick lengths.
#[derive(Debug)]
#[repr(transparent)]
pub struct NonZeroDuration<U: TimeUnit>(NonZeroU64, PhantomData<U>);

// Manual impls: derives would demand `U: Clone` etc. on an uninhabited marker.
macro_rules! impl_value_traits {
    ($ty:ident) => {
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
    };
}

impl_value_traits!(Duration);
impl_value_traits!(MonoInstant);
impl_value_traits!(NonZeroDuration);

impl<U: TimeUnit> Duration<U> {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Duration<Millis> {
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value)
    }

    /// Converts to a std duration for blocking primitives.
    #[inline]
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }
}

impl<U: TimeUnit> core::fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

impl<U: TimeUnit> MonoInstant<U> {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Span from `earlier` to `self`, zero if `earlier` is not earlier.
    #[inline]
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for MonoInstant<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0.saturating_add(rhs.0))
    }
}

impl<U: TimeUnit> NonZeroDuration<U> {
    #[inline]
    #[must_use]
    pub const fn new(value: NonZeroU64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> Duration<U> {
        Duration::new(self.0.get())
    }

    /// `ticks` whole tick lengths.
    #[inline]
    #[must_use]
    pub const fn times(self, ticks: u64) -> Duration<U> {
        Duration::new(self.0.get().saturating_mul(ticks))
    }
}

impl NonZeroDuration<Millis> {
    /// Builds a tick length from milliseconds, `None` for zero.
    #[must_use]
    pub const fn from_millis(value: u64) -> Option<Self> {
        match NonZeroU64::new(value) {
            Some(v) => Some(Self::new(v)),
            None => None,
        }
    }
}

/// Source of monotonic milliseconds.
pub trait Clock: Send {
    fn now(&self) -> MonoInstant<Millis>;
}

/// Process-relative monotonic clock backed by the TSC where available.
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
    fn now(&self) -> MonoInstant<Millis> {
        let elapsed = self.origin.elapsed().as_millis();
        MonoInstant::new(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

/// Hand-driven clock. Clones share the same reading, so a test can keep one
/// copy and advance time under a wheel that owns the other.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    #[must_use]
    pub fn starting_at(ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration<Millis>) {
        self.0.fetch_add(by.as_u64(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoInstant<Millis> {
        MonoInstant::new(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_length_multiplies_with_saturation() {
        let tick = NonZeroDuration::<Millis>::from_millis(10).unwrap();
        assert_eq!(tick.times(3), Duration::from_millis(30));
        assert_eq!(tick.times(u64::MAX).as_u64(), u64::MAX);
        assert!(NonZeroDuration::<Millis>::from_millis(0).is_none());
    }

    #[test]
    fn saturating_since_never_underflows() {
        let a = MonoInstant::<Millis>::new(5);
        let b = MonoInstant::<Millis>::new(9);
        assert_eq!(b.saturating_since(a), Duration::from_millis(4));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn manual_clock_clones_share_reading() {
        let clock = ManualClock::starting_at(100);
        let other = clock.clone();
        clock.advance(Duration::from_millis(20));
        assert_eq!(other.now().as_u64(), 120);
        other.set(7);
        assert_eq!(clock.now().as_u64(), 7);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
