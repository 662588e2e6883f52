//! Generational slab holding timer nodes.
//!
//! Nodes are linked into the wheel's ordered list through `prev`/`next`
//! indices, so unlinking is O(1) and no node ever moves in memory.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

use super::time::{MonoInstant, Millis};

/// Typed slab index.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlabIndex<T>(u32, PhantomData<T>);

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> SlabIndex<T> {
    #[inline]
    pub(crate) const fn new(idx: u32) -> Self {
        Self(idx, PhantomData)
    }

    #[inline]
    pub(crate) const fn get(self) -> u32 {
        self.0
    }
}

impl<T> From<SlabIndex<T>> for usize {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0 as Self
    }
}

/// Timer node stored in the slab.
pub struct Node<T> {
    pub payload: T,
    pub generation: u32,
    /// Delay in ticks last passed to `add`/`re_add`.
    pub interval: u64,
    pub repeat: bool,
    /// Absolute expiry; meaningful only while `linked`.
    pub expire: MonoInstant<Millis>,
    pub linked: bool,
    pub prev: Option<SlabIndex<T>>,
    pub next: Option<SlabIndex<T>>,
}

pub struct FreeSlot<T> {
    pub next: Option<SlabIndex<T>>,
    pub generation: u32,
}

pub enum Entry<T> {
    Occupied(Node<T>),
    Free(FreeSlot<T>),
}

/// Fixed-capacity slab with an intrusive free list.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    occupied: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with `cap` free slots. Capacity is clamped to `u32::MAX`.
    #[must_use]
    pub fn with_capacity(cap: NonZeroUsize) -> Self {
        let capacity = u32::try_from(cap.get()).unwrap_or(u32::MAX);
        let entries = (0..capacity)
            .map(|i| {
                Entry::Free(FreeSlot {
                    next: (i + 1 < capacity).then(|| SlabIndex::new(i + 1)),
                    generation: 0,
                })
            })
            .collect();
        Self {
            entries,
            free_head: Some(SlabIndex::new(0)),
            occupied: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Stores an unlinked node, returning its index and generation.
    pub fn alloc(&mut self, payload: T, repeat: bool) -> Option<(SlabIndex<T>, u32)> {
        let head = self.free_head?;
        let generation = match &self.entries[usize::from(head)] {
            Entry::Free(slot) => {
                self.free_head = slot.next;
                slot.generation
            }
            Entry::Occupied(_) => return None,
        };
        self.entries[usize::from(head)] = Entry::Occupied(Node {
            payload,
            generation,
            interval: 0,
            repeat,
            expire: MonoInstant::new(0),
            linked: false,
            prev: None,
            next: None,
        });
        self.occupied += 1;
        Some((head, generation))
    }

    /// Frees a slot, bumping its generation so outstanding ids go stale.
    pub fn free(&mut self, idx: SlabIndex<T>) -> Option<T> {
        let generation = match self.entries.get(usize::from(idx))? {
            Entry::Occupied(n) => n.generation,
            Entry::Free(_) => return None,
        };
        let old = core::mem::replace(
            &mut self.entries[usize::from(idx)],
            Entry::Free(FreeSlot {
                next: self.free_head,
                generation: generation.wrapping_add(1),
            }),
        );
        self.free_head = Some(idx);
        self.occupied -= 1;
        match old {
            Entry::Occupied(node) => Some(node.payload),
            Entry::Free(_) => None,
        }
    }

    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&Node<T>> {
        match self.entries.get(usize::from(idx))? {
            Entry::Occupied(n) => Some(n),
            Entry::Free(_) => None,
        }
    }

    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut Node<T>> {
        match self.entries.get_mut(usize::from(idx))? {
            Entry::Occupied(n) => Some(n),
            Entry::Free(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(cap: usize) -> Slab<&'static str> {
        Slab::with_capacity(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn alloc_until_full() {
        let mut s = slab(2);
        assert!(s.alloc("a", false).is_some());
        assert!(s.alloc("b", true).is_some());
        assert!(s.alloc("c", false).is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn free_bumps_generation_and_reuses_slot() {
        let mut s = slab(1);
        let (idx, gen0) = s.alloc("a", false).unwrap();
        assert_eq!(s.free(idx), Some("a"));
        assert!(s.get(idx).is_none());
        assert_eq!(s.free(idx), None, "double free is a no-op");

        let (idx2, gen1) = s.alloc("b", false).unwrap();
        assert_eq!(idx, idx2);
        assert_eq!(gen1, gen0.wrapping_add(1));
        assert!(!s.get(idx2).unwrap().linked);
    }
}
