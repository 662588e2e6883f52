//! Bounded lock-free MPSC ring with per-slot sequence numbers.
//!
//! Vyukov's bounded queue, reduced to a single consumer:
//!
//! - each slot carries an atomic sequence number, initially its index
//! - a producer claims position `pos` by CAS on `head` once `seq == pos`,
//!   writes, then publishes with `seq = pos + 1`
//! - the consumer reads when `seq == tail + 1`, then releases the slot for
//!   the next lap with `seq = tail + capacity`
//!
//! Producers never block: a full ring hands the item back.
//!
//! With a single slot, "published" (`pos + 1`) and "free for the next lap"
//! (`pos + capacity`) coincide, so the ring always keeps at least two slots
//! and bounds occupancy by the logical capacity against `tail`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
struct Cursor(AtomicUsize);

pub(crate) struct Ring<T> {
    head: Cursor,
    tail: Cursor,
    capacity: usize,
    slots: Box<[Slot<T>]>,
}

// SAFETY: values cross threads by move only, and every slot access is
// serialized by its sequence number.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity.max(2))
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
            capacity,
            slots,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues `item`, or returns it when the ring is full.
    ///
    /// Safe for any number of concurrent callers.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let cap = self.slots.len();
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            // A stale tail only overstates occupancy; a stale `pos` may sit
            // behind it and is retried below.
            let tail = self.tail.0.load(Ordering::Acquire);
            if pos.wrapping_sub(tail) as isize >= self.capacity as isize {
                return Err(item);
            }

            if diff == 0 {
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave us exclusive ownership of this
                        // lap of the slot, and seq == pos means it is empty.
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(item);
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest published item.
    ///
    /// # Safety
    ///
    /// At most one thread may call this at a time.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let cap = self.slots.len();
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail % cap];

        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }
        // SAFETY: the producer published this slot (seq == tail + 1) and the
        // caller guarantees we are the only reader.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(cap), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` makes us the only accessor.
        while unsafe { self.pop() }.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let ring = Ring::with_capacity(8);
        for i in 1..=3 {
            ring.push(i).unwrap();
        }
        unsafe {
            assert_eq!(ring.pop(), Some(1));
            assert_eq!(ring.pop(), Some(2));
            assert_eq!(ring.pop(), Some(3));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn full_ring_returns_item_and_recovers() {
        let ring = Ring::with_capacity(3);
        for i in 0..3 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(unsafe { ring.pop() }, Some(0));
        ring.push(3).unwrap();
        assert_eq!(ring.push(4), Err(4));
    }

    #[test]
    fn single_slot_holds_one_item() {
        let marker = Arc::new(());
        let ring = Ring::with_capacity(1);
        assert_eq!(ring.capacity(), 1);
        for _ in 0..3 {
            ring.push(Arc::clone(&marker)).unwrap();
            assert!(ring.push(Arc::clone(&marker)).is_err());
            assert_eq!(Arc::strong_count(&marker), 2);
            assert!(unsafe { ring.pop() }.is_some());
            assert!(unsafe { ring.pop() }.is_none());
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn wraps_many_laps() {
        let ring = Ring::with_capacity(2);
        for i in 0..1000u32 {
            ring.push(i).unwrap();
            assert_eq!(unsafe { ring.pop() }, Some(i));
        }
    }

    #[test]
    fn drop_releases_queued_items() {
        let marker = Arc::new(());
        let ring = Ring::with_capacity(4);
        ring.push(Arc::clone(&marker)).unwrap();
        ring.push(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 3);
        drop(ring);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_producers_deliver_everything() {
        let ring = Arc::new(Ring::with_capacity(16));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let mut v = p * 1000 + i;
                        while let Err(back) = ring.push(v) {
                            v = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut got = Vec::new();
        while got.len() < 1000 {
            match unsafe { ring.pop() } {
                Some(v) => got.push(v),
                None => thread::yield_now(),
            }
        }
        for h in producers {
            h.join().unwrap();
        }
        got.sort_unstable();
        let mut want: Vec<u64> = (0..4).flat_map(|p| (0..250).map(move |i| p * 1000 + i)).collect();
        want.sort_unstable();
        assert_eq!(got, want);
    }
}
