//! Sorted timer list with a cached current time.
//!
//! Armed timers form a doubly-linked list threaded through the slab in
//! ascending expiry order; equal expiries keep insertion order. Arming is a
//! linear ordered insert, cancelling is O(1), and firing `k` due timers costs
//! O(k) because only the head is ever inspected.
//!
//! The wheel is owned by exactly one loop. Time only advances when the loop
//! calls [`TimerWheel::time_update`], so a burst of firings within one wake
//! all observe the same "now".

use core::num::NonZeroUsize;

use crate::config::WheelConfig;
use crate::runtime::timing::slab::{Slab, SlabIndex};
use crate::runtime::timing::time::{
    Clock, Duration, Millis, MonoInstant, MonotonicClock, NonZeroDuration,
};
use crate::trace::trace;

/// Stable handle to a timer created on a [`TimerWheel`].
///
/// Carries the slot generation, so a handle to a destroyed timer never
/// aliases whatever reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

impl core::fmt::Display for TimerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "timer#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("timer arena exhausted ({capacity} timers)")]
    Full { capacity: usize },
}

type WakeHook = Box<dyn FnMut() + Send>;

/// Ordered timer collection for a single loop.
///
/// `T` is the payload handed back when a timer fires; loops typically use a
/// small `Copy` event enum naming what to do.
pub struct TimerWheel<T> {
    slab: Slab<T>,
    head: Option<SlabIndex<T>>,
    tail: Option<SlabIndex<T>>,
    armed: usize,
    tick: NonZeroDuration<Millis>,
    now: MonoInstant<Millis>,
    next_wake: Option<MonoInstant<Millis>>,
    clock: Box<dyn Clock>,
    wake_hook: Option<WakeHook>,
}

impl<T> TimerWheel<T> {
    /// Creates an empty wheel on the process monotonic clock.
    #[must_use]
    pub fn new(config: WheelConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }

    /// Creates an empty wheel reading time from `clock`. The current time is
    /// sampled once here.
    #[must_use]
    pub fn with_clock(config: WheelConfig, clock: impl Clock + 'static) -> Self {
        let clock: Box<dyn Clock> = Box::new(clock);
        let now = clock.now();
        Self {
            slab: Slab::with_capacity(config.capacity),
            head: None,
            tail: None,
            armed: 0,
            tick: config.tick,
            now,
            next_wake: None,
            clock,
            wake_hook: None,
        }
    }

    /// Installs a hook run whenever arming a timer moves the earliest expiry
    /// earlier than the last computed wait.
    ///
    /// Owners whose loop may be blocked while something else arms timers use
    /// this to nudge the loop into recomputing its timeout.
    pub fn set_wake_hook(&mut self, hook: impl FnMut() + Send + 'static) {
        self.wake_hook = Some(Box::new(hook));
    }

    #[must_use]
    pub const fn now(&self) -> MonoInstant<Millis> {
        self.now
    }

    #[must_use]
    pub const fn tick(&self) -> NonZeroDuration<Millis> {
        self.tick
    }

    /// Number of armed timers.
    #[must_use]
    pub const fn armed(&self) -> usize {
        self.armed
    }

    /// Number of created (armed or idle) timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.slab.capacity()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Re-samples the clock into the cached current time.
    pub fn time_update(&mut self) {
        self.now = self.clock.now();
    }

    /// Allocates an idle timer carrying `payload`.
    ///
    /// # Errors
    ///
    /// [`WheelError::Full`] when every slot is in use.
    pub fn create(&mut self, payload: T, repeat: bool) -> Result<TimerId, WheelError> {
        let (idx, generation) = self.slab.alloc(payload, repeat).ok_or(WheelError::Full {
            capacity: self.slab.capacity(),
        })?;
        Ok(TimerId {
            index: idx.get(),
            generation,
        })
    }

    /// Cancels and frees a timer, returning its payload. Stale ids yield `None`.
    pub fn destroy(&mut self, id: TimerId) -> Option<T> {
        let idx = self.resolve(id)?;
        self.unlink(idx);
        self.slab.free(idx)
    }

    /// Arms `id` to expire `delay_ticks` ticks after the cached current time.
    ///
    /// The timer must not already be armed: remove it with
    /// [`delete`](Self::delete) first, or use [`re_add`](Self::re_add) from its
    /// own firing. Debug builds assert this; release builds unlink the stale
    /// position before inserting so the list stays sorted.
    pub fn add(&mut self, id: TimerId, delay_ticks: u64) {
        let Some(idx) = self.resolve(id) else { return };
        let expire = self.now + self.tick.times(delay_ticks);
        self.arm(idx, delay_ticks, expire);
    }

    /// Re-arms `id` one interval after its previous expiry rather than after
    /// the current time, so periodic timers do not drift with dispatch latency.
    ///
    /// Same precondition as [`add`](Self::add).
    pub fn re_add(&mut self, id: TimerId) {
        let Some(idx) = self.resolve(id) else { return };
        let Some((interval, previous)) = self.slab.get(idx).map(|n| (n.interval, n.expire)) else {
            return;
        };
        let expire = previous + self.tick.times(interval);
        self.arm(idx, interval, expire);
    }

    /// Disarms `id` if armed. Idempotent; stale ids are ignored.
    pub fn delete(&mut self, id: TimerId) {
        if let Some(idx) = self.resolve(id) {
            self.unlink(idx);
        }
    }

    #[must_use]
    pub fn is_running(&self, id: TimerId) -> bool {
        self.resolve(id)
            .and_then(|idx| self.slab.get(idx))
            .is_some_and(|n| n.linked)
    }

    /// Time left before `id` expires; zero when due or not armed.
    #[must_use]
    pub fn time_to_expire(&self, id: TimerId) -> Duration<Millis> {
        self.resolve(id)
            .and_then(|idx| self.slab.get(idx))
            .filter(|n| n.linked)
            .map_or(Duration::ZERO, |n| n.expire.saturating_since(self.now))
    }

    #[must_use]
    pub fn payload(&self, id: TimerId) -> Option<&T> {
        self.resolve(id)
            .and_then(|idx| self.slab.get(idx))
            .map(|n| &n.payload)
    }

    pub fn payload_mut(&mut self, id: TimerId) -> Option<&mut T> {
        let idx = self.resolve(id)?;
        self.slab.get_mut(idx).map(|n| &mut n.payload)
    }

    /// How long the owning loop may block: `None` with nothing armed, zero
    /// when the head is already due. Refreshes the cached wake time.
    pub fn next_timeout(&mut self) -> Option<Duration<Millis>> {
        let Some(expire) = self.head.and_then(|h| self.slab.get(h)).map(|n| n.expire) else {
            self.next_wake = None;
            return None;
        };
        self.next_wake = Some(expire);
        Some(expire.saturating_since(self.now))
    }

    /// Armed timers in firing order.
    pub fn iter_armed(&self) -> impl Iterator<Item = (TimerId, MonoInstant<Millis>)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.slab.get(idx)?;
            cursor = node.next;
            Some((
                TimerId {
                    index: idx.get(),
                    generation: node.generation,
                },
                node.expire,
            ))
        })
    }

    fn resolve(&self, id: TimerId) -> Option<SlabIndex<T>> {
        let idx = SlabIndex::new(id.index);
        self.slab
            .get(idx)
            .filter(|n| n.generation == id.generation)
            .map(|_| idx)
    }

    fn arm(&mut self, idx: SlabIndex<T>, interval: u64, expire: MonoInstant<Millis>) {
        let was_linked = self.slab.get(idx).is_some_and(|n| n.linked);
        debug_assert!(!was_linked, "timer armed twice without delete");
        if was_linked {
            self.unlink(idx);
        }
        if let Some(node) = self.slab.get_mut(idx) {
            node.interval = interval;
        }
        self.link(idx, expire);

        if self.next_wake.map_or(true, |wait| expire < wait) {
            self.next_wake = Some(expire);
            if let Some(hook) = self.wake_hook.as_mut() {
                hook();
            }
        }
    }

    fn link(&mut self, idx: SlabIndex<T>, expire: MonoInstant<Millis>) {
        // First node strictly later than `expire`; ties stay ahead of us.
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let Some(node) = self.slab.get(c) else { break };
            if node.expire > expire {
                break;
            }
            cursor = node.next;
        }
        let prev = match cursor {
            Some(c) => self.slab.get(c).and_then(|n| n.prev),
            None => self.tail,
        };

        if let Some(node) = self.slab.get_mut(idx) {
            node.expire = expire;
            node.linked = true;
            node.prev = prev;
            node.next = cursor;
        }
        match prev {
            Some(p) => {
                if let Some(n) = self.slab.get_mut(p) {
                    n.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        match cursor {
            Some(c) => {
                if let Some(n) = self.slab.get_mut(c) {
                    n.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.armed += 1;
    }

    fn unlink(&mut self, idx: SlabIndex<T>) -> bool {
        let (prev, next) = match self.slab.get_mut(idx) {
            Some(n) if n.linked => {
                n.linked = false;
                (n.prev.take(), n.next.take())
            }
            _ => return false,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slab.get_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slab.get_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        self.armed -= 1;
        true
    }
}

impl<T: Clone> TimerWheel<T> {
    /// Pops the head if it is due against the cached time.
    ///
    /// The timer is unlinked first and, if repeating, re-armed one interval
    /// from now before this returns, so the caller is free to touch the wheel
    /// (including this same timer) while handling the event. A repeating
    /// timer with a zero interval is re-armed one tick out.
    pub fn pop_expired(&mut self) -> Option<(TimerId, T)> {
        let idx = self.head?;
        let node = self.slab.get(idx)?;
        if node.expire > self.now {
            return None;
        }
        let id = TimerId {
            index: idx.get(),
            generation: node.generation,
        };
        let (repeat, interval, payload) = (node.repeat, node.interval, node.payload.clone());

        self.unlink(idx);
        if repeat {
            let expire = self.now + self.tick.times(interval.max(1));
            self.arm(idx, interval, expire);
        }
        trace!(%id, repeat, "timer fired");
        Some((id, payload))
    }

    /// Fires every due timer in expiry order, handing the wheel back to the
    /// callback so it can arm or cancel timers, itself included.
    pub fn process(&mut self, mut on_fire: impl FnMut(&mut Self, TimerId, T)) -> usize {
        let mut fired = 0;
        while let Some((id, payload)) = self.pop_expired() {
            on_fire(self, id, payload);
            fired += 1;
        }
        fired
    }
}
