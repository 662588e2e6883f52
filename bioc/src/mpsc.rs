//! Bounded multi-producer single-consumer queue for cross-thread handoff.
//!
//! [`Sender`]s are cheap to clone and may push from any thread without
//! blocking; the single [`Receiver`] drains in FIFO order.
//!
//! ```
//! let (tx, rx) = bioc::mpsc::channel::<u32>(4);
//! tx.try_send(7).unwrap();
//! assert_eq!(rx.try_recv(), Some(7));
//! ```

mod ring;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use ring::Ring;

/// Write end; clone freely.
pub struct Sender<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end. `Send` but not `Sync`, which keeps the ring single-consumer.
pub struct Receiver<T> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomData<Cell<()>>,
}

/// Creates a queue holding at most `capacity` items (minimum one).
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Sender {
            ring: Arc::clone(&ring),
        },
        Receiver {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Sender<T> {
    /// Enqueues without blocking.
    ///
    /// # Errors
    ///
    /// Hands `item` back when the queue is full.
    #[inline]
    pub fn try_send(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Send> Receiver<T> {
    #[inline]
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        // SAFETY: `Receiver` is neither `Clone` nor `Sync`, so this is the
        // only thread popping.
        unsafe { self.ring.pop() }
    }
}
