//! Timing primitives: typed time units, the clock seam and the timer wheel.
//!
//! Each loop owns its own [`TimerWheel`]; nothing here is shared across
//! threads.

mod slab;
mod time;
mod wheel;

pub use time::{
    Clock, Duration, ManualClock, Millis, MonoInstant, MonotonicClock, NonZeroDuration, TimeUnit,
};
pub use wheel::{TimerId, TimerWheel, WheelError};
