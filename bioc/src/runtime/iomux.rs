//! Readiness multiplexer driving a timer wheel.
//!
//! One loop owns an [`IoMux`]: a set of registered descriptors plus the
//! [`TimerWheel`] whose next expiry bounds every readiness wait. Each wake
//! runs in a fixed order:
//!
//! 1. wait in `poll(2)` on the union of all interest sets, for at most the
//!    wheel's next timeout (forever when nothing is armed)
//! 2. refresh the wheel's clock and fire every due timer, whether the wake
//!    came from readiness, timeout or a failed wait
//! 3. hand each ready instance to exactly one callback: readable, else
//!    writable, else error
//!
//! Anything still pending after step 3 is seen again on the next wake, so a
//! chatty descriptor cannot monopolize a single pass.
//!
//! Callbacks receive `&mut IoMux` and may register, remove, arm or cancel
//! freely; removal of an instance that is also in the current ready set is
//! detected through its generation and skipped.

use std::io;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use rustix::event::{PollFd, PollFlags, Timespec};

use crate::config::WheelConfig;
use crate::net::set_nonblocking;
use crate::runtime::timing::{Duration, Millis, TimerId, TimerWheel};
use crate::trace::{debug, trace, warn};

bitflags! {
    /// Conditions an instance wants to be woken for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        /// Exceptional conditions (`POLLPRI`). Errors and hang-ups are always
        /// reported regardless of interest.
        const ERROR    = 0b100;
    }
}

impl Interest {
    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(Self::READABLE) {
            flags |= PollFlags::IN;
        }
        if self.contains(Self::WRITABLE) {
            flags |= PollFlags::OUT;
        }
        if self.contains(Self::ERROR) {
            flags |= PollFlags::PRI;
        }
        flags
    }
}

/// Descriptor owned by an instance. Dropping it closes the descriptor.
#[derive(Debug)]
pub enum IoSource {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
    Unix(UnixStream),
    /// Anything else: serial ports, pipes, stdin duplicates.
    Fd(OwnedFd),
}

impl AsFd for IoSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Listener(s) => s.as_fd(),
            Self::Stream(s) => s.as_fd(),
            Self::Datagram(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
            Self::Fd(fd) => fd.as_fd(),
        }
    }
}

/// A registration request: the descriptor, what to wait for, and the
/// caller's per-instance data.
#[derive(Debug)]
pub struct IoInstance<K> {
    pub source: IoSource,
    pub interest: Interest,
    pub nonblocking: bool,
    pub data: K,
}

impl<K> IoInstance<K> {
    /// A non-blocking instance interested in readability only.
    pub fn readable(source: IoSource, data: K) -> Self {
        Self {
            source,
            interest: Interest::READABLE,
            nonblocking: true,
            data,
        }
    }

    #[must_use]
    pub fn with_interest(mut self, interest: Interest) -> Self {
        self.interest = interest;
        self
    }

    #[must_use]
    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }
}

/// Handle to a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoKey {
    index: u32,
    generation: u32,
}

/// Event callbacks for one loop.
///
/// Only the callbacks matching an instance's [`Interest`] are invoked. The
/// default `on_error` unregisters the instance, so a descriptor that failed
/// and has no error handling cannot spin the loop.
pub trait IoHandler<K, T> {
    fn on_readable(&mut self, mux: &mut IoMux<K, T>, key: IoKey) {
        let _ = (mux, key);
    }

    fn on_writable(&mut self, mux: &mut IoMux<K, T>, key: IoKey) {
        let _ = (mux, key);
    }

    fn on_error(&mut self, mux: &mut IoMux<K, T>, key: IoKey) {
        debug!(?key, "dropping instance after error");
        mux.del(key);
    }

    fn on_timer(&mut self, mux: &mut IoMux<K, T>, id: TimerId, event: T) {
        let _ = (mux, id, event);
    }
}

struct Slot<K> {
    generation: u32,
    instance: Option<IoInstance<K>>,
}

#[derive(Clone, Copy)]
enum Ready {
    Readable,
    Writable,
    Error,
}

/// Registered instances plus the loop's timer wheel.
pub struct IoMux<K, T> {
    slots: Vec<Slot<K>>,
    free: Vec<u32>,
    live: usize,
    timers: TimerWheel<T>,
    ready: Vec<(IoKey, Ready)>,
    /// Per-wake scratch, parallel to `pollfds`.
    polled: Vec<(IoKey, Interest)>,
    /// Only holds entries while `wait` runs; emptied before it returns.
    pollfds: Vec<PollFd<'static>>,
    max_wait: Option<Duration<Millis>>,
}

impl<K, T> IoMux<K, T> {
    #[must_use]
    pub fn new(wheel: WheelConfig) -> Self {
        Self::with_timers(TimerWheel::new(wheel))
    }

    /// Builds a multiplexer around an existing wheel.
    #[must_use]
    pub fn with_timers(timers: TimerWheel<T>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            timers,
            ready: Vec::new(),
            polled: Vec::new(),
            pollfds: Vec::new(),
            max_wait: None,
        }
    }

    /// Caps every readiness wait, so [`run_until`](Self::run_until) notices
    /// its stop flag even when nothing is armed.
    pub fn set_max_wait(&mut self, max_wait: Option<Duration<Millis>>) {
        self.max_wait = max_wait;
    }

    pub fn timers(&self) -> &TimerWheel<T> {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerWheel<T> {
        &mut self.timers
    }

    /// Number of registered instances.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Registers an instance, switching it to non-blocking mode first when
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error if the blocking mode cannot be changed; the
    /// instance is dropped (and closed) in that case.
    pub fn add(&mut self, instance: IoInstance<K>) -> io::Result<IoKey> {
        if instance.nonblocking {
            set_nonblocking(&instance.source, true)?;
        }
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.instance = Some(instance);
                IoKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "too many instances"))?;
                self.slots.push(Slot {
                    generation: 0,
                    instance: Some(instance),
                });
                IoKey {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        trace!(?key, "instance registered");
        Ok(key)
    }

    /// Unregisters an instance and closes its descriptor. Returns the
    /// caller's data, or `None` for a stale key.
    pub fn del(&mut self, key: IoKey) -> Option<K> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let instance = slot.instance.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        trace!(?key, "instance removed");
        Some(instance.data)
    }

    /// Borrows a live instance.
    #[must_use]
    pub fn get(&self, key: IoKey) -> Option<&IoInstance<K>> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.instance.as_ref())
    }

    pub fn get_mut(&mut self, key: IoKey) -> Option<&mut IoInstance<K>> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.instance.as_mut())
    }

    /// Changes what an instance waits for; returns `false` for a stale key.
    pub fn set_interest(&mut self, key: IoKey, interest: Interest) -> bool {
        self.get_mut(key).map(|i| i.interest = interest).is_some()
    }

    /// Live instances, in slot order.
    pub fn keys(&self) -> impl Iterator<Item = IoKey> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.instance.as_ref().map(|_| IoKey {
                index: i as u32,
                generation: s.generation,
            })
        })
    }

}

impl<K, T: Clone> IoMux<K, T> {
    /// One wake of the loop. Returns how many I/O callbacks ran.
    pub fn turn<H: IoHandler<K, T>>(&mut self, handler: &mut H) -> usize {
        let timeout = match (self.timers.next_timeout(), self.max_wait) {
            (Some(t), Some(cap)) => Some(t.min(cap)),
            (t, cap) => t.or(cap),
        };
        let polled = self.wait(timeout);

        self.timers.time_update();
        while let Some((id, event)) = self.timers.pop_expired() {
            handler.on_timer(self, id, event);
        }

        if let Err(err) = polled {
            warn!(%err, "readiness wait failed; polling again");
            return 0;
        }

        let mut ready = std::mem::take(&mut self.ready);
        let mut dispatched = 0;
        for &(key, what) in &ready {
            if self.get(key).is_none() {
                continue;
            }
            match what {
                Ready::Readable => handler.on_readable(self, key),
                Ready::Writable => handler.on_writable(self, key),
                Ready::Error => handler.on_error(self, key),
            }
            dispatched += 1;
        }
        ready.clear();
        self.ready = ready;
        dispatched
    }

    /// Runs wakes until `stop` is observed set between two wakes.
    pub fn run_until<H: IoHandler<K, T>>(&mut self, handler: &mut H, stop: &AtomicBool) {
        debug!(instances = self.live, "io loop started");
        while !stop.load(Ordering::Acquire) {
            self.turn(handler);
        }
        debug!("io loop stopped");
    }

    /// Runs wakes forever.
    pub fn run_loop<H: IoHandler<K, T>>(&mut self, handler: &mut H) -> ! {
        debug!(instances = self.live, "io loop started");
        loop {
            self.turn(handler);
        }
    }

    /// Blocks in `poll(2)` and records at most one readiness per instance
    /// into `self.ready`.
    fn wait(&mut self, timeout: Option<Duration<Millis>>) -> io::Result<()> {
        self.polled.clear();
        self.pollfds.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(inst) = slot.instance.as_ref() else {
                continue;
            };
            if inst.interest.is_empty() {
                continue;
            }
            self.polled.push((
                IoKey {
                    index: index as u32,
                    generation: slot.generation,
                },
                inst.interest,
            ));
            // SAFETY: the descriptor is owned by `self.slots`, which nothing
            // mutates until `pollfds` is cleared below.
            let fd = unsafe { BorrowedFd::borrow_raw(inst.source.as_fd().as_raw_fd()) };
            self.pollfds.push(PollFd::from_borrowed_fd(fd, inst.interest.poll_flags()));
        }

        let spec = timeout.map(|t| {
            let ms = t.as_u64();
            Timespec {
                tv_sec: (ms / 1000) as _,
                tv_nsec: ((ms % 1000) * 1_000_000) as _,
            }
        });
        let polled = rustix::event::poll(&mut self.pollfds, spec.as_ref());

        if polled.is_ok() {
            for (&(key, interest), fd) in self.polled.iter().zip(&self.pollfds) {
                if let Some(what) = classify(interest, fd.revents()) {
                    self.ready.push((key, what));
                }
            }
        }
        self.pollfds.clear();
        polled?;
        Ok(())
    }
}

/// Picks the single callback a wake delivers for these events.
fn classify(interest: Interest, revents: PollFlags) -> Option<Ready> {
    if revents.is_empty() {
        return None;
    }
    // Like select(2): errors and hang-ups make a descriptor readable and
    // writable, so the owner's read or write observes the failure itself.
    let failed = PollFlags::ERR | PollFlags::HUP;
    if interest.contains(Interest::READABLE) && revents.intersects(PollFlags::IN | failed) {
        return Some(Ready::Readable);
    }
    if interest.contains(Interest::WRITABLE) && revents.intersects(PollFlags::OUT | failed) {
        return Some(Ready::Writable);
    }
    if revents.intersects(PollFlags::PRI | PollFlags::NVAL | failed) {
        return Some(Ready::Error);
    }
    None
}
