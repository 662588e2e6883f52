//! Bounded request mailbox and the worker loop that drains it.
//!
//! # Lifecycle of a request
//!
//! ```text
//! post ──> pool slot taken ──> FIFO ──> worker wakes ──> timers fire
//!                                                 ──> handler runs ──> completion ──> slot released
//! ```
//!
//! Producers may run on any thread, including ones that must never block:
//! [`Poster::post`] either enqueues immediately or reports [`Dropped`]. The
//! in-flight pool and the FIFO are both fixed size; a post that finds the
//! pool exhausted, or the FIFO momentarily full, is dropped on the spot.
//! Posting is therefore never a delivery guarantee.
//!
//! The worker owns a [`TimerWheel`]. Like the I/O loop, it sleeps for at
//! most the wheel's next timeout, fires due timers on every wake, and only
//! then handles a single request.
//!
//! # Example
//!
//! ```
//! use bioc::config::DispatcherConfig;
//! use bioc::runtime::dispatch::{self, ErrorCode, HandlerTable, Request, RequestKind};
//!
//! let handlers = HandlerTable::<()>::new()
//!     .on(RequestKind::GotIp, |_, _, _| ErrorCode::Ok);
//! let (poster, mut worker) = dispatch::channel(DispatcherConfig::default(), handlers);
//!
//! poster.post(Request::GotIp, None).unwrap();
//! assert_eq!(worker.turn(Some(std::time::Duration::ZERO)), Some(ErrorCode::Ok));
//! ```

mod request;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration as StdDuration;

use crate::config::DispatcherConfig;
use crate::mpsc;
use crate::runtime::timing::{TimerId, TimerWheel};
use crate::trace::{debug, info, trace};

pub use request::{
    ErrorCode, PeripheralEvent, PeripheralSource, PeripheralTopic, RawFrame, Request,
    RequestKind, Response, TemperatureReading, UartPayload, PERIPHERAL_DATA_WORDS,
    RAW_FRAME_CAPACITY,
};

/// Completion callback. Captures whatever context the poster needs and is
/// called exactly once, on the worker thread.
pub type Completion = Box<dyn FnOnce(ErrorCode, &Response) + Send>;

type Handler<T> = Box<dyn FnMut(&mut TimerWheel<T>, &Request, &mut Response) -> ErrorCode + Send>;
type TimerHandler<T> = Box<dyn FnMut(&mut TimerWheel<T>, TimerId, T) + Send>;

/// Which bound rejected a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    PoolExhausted,
    QueueFull,
}

impl core::fmt::Display for DropReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::PoolExhausted => "request pool exhausted",
            Self::QueueFull => "request queue full",
        })
    }
}

/// A post was rejected; the request was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request dropped: {reason}")]
pub struct Dropped {
    pub reason: DropReason,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handlers keyed by [`RequestKind`], plus the timer callback.
///
/// `Wake` requests are always answered `Ok` by the worker itself; any kind
/// without a handler is logged and answered [`ErrorCode::General`].
pub struct HandlerTable<T> {
    handlers: [Option<Handler<T>>; RequestKind::COUNT],
    on_timer: Option<TimerHandler<T>>,
}

impl<T> HandlerTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
            on_timer: None,
        }
    }

    /// Registers the handler for `kind`, replacing any previous one.
    #[must_use]
    pub fn on(
        mut self,
        kind: RequestKind,
        handler: impl FnMut(&mut TimerWheel<T>, &Request, &mut Response) -> ErrorCode + Send + 'static,
    ) -> Self {
        self.handlers[kind.index()] = Some(Box::new(handler));
        self
    }

    /// Registers the callback for timers armed on the worker's wheel.
    #[must_use]
    pub fn on_timer(
        mut self,
        handler: impl FnMut(&mut TimerWheel<T>, TimerId, T) + Send + 'static,
    ) -> Self {
        self.on_timer = Some(Box::new(handler));
        self
    }

    fn dispatch(&mut self, timers: &mut TimerWheel<T>, request: &Request, rsp: &mut Response) -> ErrorCode {
        let kind = request.kind();
        if kind == RequestKind::Wake {
            return ErrorCode::Ok;
        }
        match self.handlers[kind.index()].as_mut() {
            Some(handler) => handler(timers, request, rsp),
            None => {
                info!(?kind, "unsupported request, dropping");
                ErrorCode::General
            }
        }
    }
}

impl<T> Default for HandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Pending {
    request: Request,
    completion: Option<Completion>,
}

struct Shared {
    in_flight: AtomicUsize,
    pool_capacity: usize,
    worker: OnceLock<Thread>,
    stop: AtomicBool,
    posted: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn try_reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.pool_capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn notify(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }
}

/// Producer handle. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Poster {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Pending>,
}

impl core::fmt::Debug for Poster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Poster")
            .field("in_flight", &self.in_flight())
            .field("capacity", &self.shared.pool_capacity)
            .finish_non_exhaustive()
    }
}

impl Poster {
    /// Queues `request` for the worker.
    ///
    /// Never blocks and never grows the pool.
    ///
    /// # Errors
    ///
    /// [`Dropped`] when the in-flight pool is exhausted or the FIFO is full.
    /// A dropped request's completion is not called.
    pub fn post(&self, request: Request, completion: Option<Completion>) -> Result<(), Dropped> {
        if !self.shared.try_reserve() {
            return Err(self.drop_request(request.kind(), DropReason::PoolExhausted));
        }
        let kind = request.kind();
        if self.tx.try_send(Pending { request, completion }).is_err() {
            self.shared.release();
            return Err(self.drop_request(kind, DropReason::QueueFull));
        }
        self.shared.posted.fetch_add(1, Ordering::Relaxed);
        self.shared.notify();
        Ok(())
    }

    /// [`post`](Self::post) with a closure completion.
    ///
    /// # Errors
    ///
    /// Same as [`post`](Self::post).
    pub fn post_with(
        &self,
        request: Request,
        completion: impl FnOnce(ErrorCode, &Response) + Send + 'static,
    ) -> Result<(), Dropped> {
        self.post(request, Some(Box::new(completion)))
    }

    /// Nudges the worker to recompute its timeout.
    ///
    /// # Errors
    ///
    /// Same as [`post`](Self::post).
    pub fn wake(&self) -> Result<(), Dropped> {
        self.post(Request::Wake, None)
    }

    /// Requests currently holding a pool slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Total posts accepted so far.
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.shared.posted.load(Ordering::Relaxed)
    }

    /// Total posts rejected so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn drop_request(&self, kind: RequestKind, reason: DropReason) -> Dropped {
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(?kind, %reason, "request dropped");
        Dropped { reason }
    }
}

/// Consumer side: owns the FIFO's read end, the wheel and the handlers.
pub struct Worker<T> {
    rx: mpsc::Receiver<Pending>,
    shared: Arc<Shared>,
    timers: TimerWheel<T>,
    handlers: HandlerTable<T>,
}

/// Creates a poster/worker pair without spawning a thread.
#[must_use]
pub fn channel<T: Clone + Send>(
    config: DispatcherConfig,
    handlers: HandlerTable<T>,
) -> (Poster, Worker<T>) {
    channel_with_timers(config, handlers, TimerWheel::new(config.wheel))
}

/// Like [`channel`], around an existing wheel (for instance one on a
/// manual clock).
#[must_use]
pub fn channel_with_timers<T: Clone + Send>(
    config: DispatcherConfig,
    handlers: HandlerTable<T>,
    timers: TimerWheel<T>,
) -> (Poster, Worker<T>) {
    let (tx, rx) = mpsc::channel(config.queue_depth.get());
    let shared = Arc::new(Shared {
        in_flight: AtomicUsize::new(0),
        pool_capacity: config.pool_capacity.get(),
        worker: OnceLock::new(),
        stop: AtomicBool::new(false),
        posted: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        Poster {
            shared: Arc::clone(&shared),
            tx,
        },
        Worker {
            rx,
            shared,
            timers,
            handlers,
        },
    )
}

impl<T: Clone> Worker<T> {
    pub fn timers(&self) -> &TimerWheel<T> {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerWheel<T> {
        &mut self.timers
    }

    /// One wake: wait for a request for at most the wheel's next timeout
    /// (further capped by `max_wait`), fire due timers, then handle at most
    /// one request.
    ///
    /// Returns the handled request's result, `None` if the wake was a pure
    /// timeout. The calling thread becomes the one producers unpark, so a
    /// worker must always be turned from the same thread.
    pub fn turn(&mut self, max_wait: Option<StdDuration>) -> Option<ErrorCode> {
        let _ = self.shared.worker.get_or_init(thread::current);

        let timeout = match (self.timers.next_timeout().map(|t| t.to_std()), max_wait) {
            (Some(t), Some(cap)) => Some(t.min(cap)),
            (t, cap) => t.or(cap),
        };
        let pending = self.rx.try_recv().or_else(|| {
            match timeout {
                Some(t) if t.is_zero() => {}
                Some(t) => thread::park_timeout(t),
                None => thread::park(),
            }
            self.rx.try_recv()
        });

        self.timers.time_update();
        while let Some((id, event)) = self.timers.pop_expired() {
            match self.handlers.on_timer.as_mut() {
                Some(on_timer) => on_timer(&mut self.timers, id, event),
                None => trace!(%id, "timer fired without a handler"),
            }
        }

        let Pending { request, completion } = pending?;
        let mut rsp = Response::default();
        let err = self.handlers.dispatch(&mut self.timers, &request, &mut rsp);
        if let Some(done) = completion {
            done(err, &rsp);
        }
        self.shared.release();
        Some(err)
    }

    /// Turns until the stop flag shared with the [`Dispatcher`] is raised.
    fn run(mut self) {
        info!("dispatcher started, waiting for requests");
        while !self.shared.stop.load(Ordering::Acquire) {
            self.turn(None);
        }
        info!("dispatcher stopped");
    }
}

/// A worker running on its own named thread.
pub struct Dispatcher {
    poster: Poster,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Spawn`] if the thread cannot be created; nothing is
    /// left running in that case.
    pub fn spawn<T: Clone + Send + 'static>(
        config: DispatcherConfig,
        handlers: HandlerTable<T>,
    ) -> Result<Self, DispatchError> {
        let (poster, worker) = channel(config, handlers);
        let handle = thread::Builder::new()
            .name("bioc-dispatch".into())
            .spawn(move || worker.run())
            .map_err(DispatchError::Spawn)?;
        // Registered before any poster escapes, so no wakeup can be missed.
        let _ = poster.shared.worker.set(handle.thread().clone());
        Ok(Self {
            poster,
            handle: Some(handle),
        })
    }

    /// A new producer handle.
    #[must_use]
    pub fn poster(&self) -> Poster {
        self.poster.clone()
    }

    /// Stops the worker after its current wake and joins it. Queued requests
    /// that were not handled yet are discarded without completion.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.poster.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
