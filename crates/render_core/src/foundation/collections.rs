//! Specialized collection types
//!
//! [`Pool`] is a fixed-capacity slot array with an intrusive free list. Every
//! slot carries a generation counter that is bumped when the slot is freed, so
//! a [`Handle`] kept past its `dealloc` is rejected instead of silently
//! aliasing whatever was allocated into the recycled slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use thiserror::Error;

/// Pool errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is in use
    #[error("Pool exhausted: all {capacity} slots are in use")]
    Exhausted {
        /// Fixed slot count of the pool
        capacity: usize,
    },

    /// The slot was freed (and possibly reused) since the handle was issued
    #[error("Stale handle: slot {index} has been recycled")]
    StaleHandle {
        /// Slot index carried by the handle
        index: u32,
    },

    /// The handle does not refer to a slot of this pool
    #[error("Invalid handle: slot {index} is out of range")]
    InvalidHandle {
        /// Slot index carried by the handle
        index: u32,
    },
}

/// Typed, generation-checked reference to a pool slot
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _phantom: PhantomData,
        }
    }

    /// Slot index inside the issuing pool
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied(T),
    Free { next: Option<u32> },
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Fixed-capacity object pool with O(1) alloc/dealloc
///
/// The backing array is allocated once in [`Pool::with_capacity`] and never
/// grows. The pool never runs GPU teardown for its values: `dealloc` hands
/// the value back so the caller can release whatever it holds.
pub struct Pool<T> {
    slots: Box<[Slot<T>]>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Pool<T> {
    /// Create a pool with `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let slots = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                entry: Entry::Free {
                    next: (i + 1 < capacity).then(|| (i + 1) as u32),
                },
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            free_head: (capacity > 0).then_some(0),
            len: 0,
        }
    }

    /// Store `value` in a free slot
    pub fn alloc(&mut self, value: T) -> Result<Handle<T>, PoolError> {
        let index = self.free_head.ok_or(PoolError::Exhausted { capacity: self.slots.len() })?;
        let slot = &mut self.slots[index as usize];

        let next = match slot.entry {
            Entry::Free { next } => next,
            // The free list only ever links free slots
            Entry::Occupied(_) => unreachable!("free list points at occupied slot {index}"),
        };

        slot.entry = Entry::Occupied(value);
        self.free_head = next;
        self.len += 1;

        Ok(Handle::new(index, slot.generation))
    }

    /// Free the slot behind `handle`, returning its value
    pub fn dealloc(&mut self, handle: Handle<T>) -> Result<T, PoolError> {
        let free_head = self.free_head;
        let slot = self.slot_mut(handle)?;

        match mem::replace(&mut slot.entry, Entry::Free { next: free_head }) {
            Entry::Occupied(value) => {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_head = Some(handle.index);
                self.len -= 1;
                Ok(value)
            }
            free @ Entry::Free { .. } => {
                slot.entry = free;
                Err(PoolError::StaleHandle { index: handle.index })
            }
        }
    }

    /// Borrow the value behind `handle`
    pub fn get(&self, handle: Handle<T>) -> Result<&T, PoolError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(PoolError::InvalidHandle { index: handle.index })?;

        match &slot.entry {
            Entry::Occupied(value) if slot.generation == handle.generation => Ok(value),
            _ => Err(PoolError::StaleHandle { index: handle.index }),
        }
    }

    /// Mutably borrow the value behind `handle`
    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, PoolError> {
        let slot = self.slot_mut(handle)?;
        match &mut slot.entry {
            Entry::Occupied(value) => Ok(value),
            Entry::Free { .. } => Err(PoolError::StaleHandle { index: handle.index }),
        }
    }

    /// Whether `handle` still refers to a live value
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is in use
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every slot is in use
    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Fixed slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over live values with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match &slot.entry {
            Entry::Occupied(value) => Some((Handle::new(i as u32, slot.generation), value)),
            Entry::Free { .. } => None,
        })
    }

    /// Free every live slot, returning the values
    ///
    /// Outstanding handles become stale.
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<_> = self.iter().map(|(handle, _)| handle).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.dealloc(handle).ok())
            .collect()
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Result<&mut Slot<T>, PoolError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(PoolError::InvalidHandle { index: handle.index })?;

        if slot.generation != handle.generation {
            return Err(PoolError::StaleHandle { index: handle.index });
        }
        Ok(slot)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_alloc_never_returns_live_handle_twice() {
        let mut pool = Pool::with_capacity(16);
        let mut live = HashSet::new();

        for i in 0..16 {
            let handle = pool.alloc(i).unwrap();
            assert!(live.insert(handle), "handle {handle:?} issued twice");
        }
        assert!(pool.is_full());
        assert_eq!(pool.len(), 16);

        // Free every other slot and refill; no live handle may be repeated
        let evens: Vec<_> = live.iter().copied().filter(|h| h.index() % 2 == 0).collect();
        for handle in evens {
            pool.dealloc(handle).unwrap();
            live.remove(&handle);
        }
        for i in 0..8 {
            let handle = pool.alloc(100 + i).unwrap();
            assert!(live.insert(handle));
        }
        assert_eq!(live.len(), 16);
    }

    #[test]
    fn test_slot_reuse_rejects_stale_handle() {
        let mut pool = Pool::with_capacity(4);
        let first = pool.alloc("mesh-a").unwrap();
        assert_eq!(pool.dealloc(first).unwrap(), "mesh-a");

        let second = pool.alloc("mesh-b").unwrap();
        // Same slot recycled, different generation
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        assert_eq!(pool.get(first), Err(PoolError::StaleHandle { index: first.index() }));
        assert_eq!(pool.dealloc(first), Err(PoolError::StaleHandle { index: first.index() }));
        assert_eq!(*pool.get(second).unwrap(), "mesh-b");
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut pool = Pool::with_capacity(2);
        let handle = pool.alloc(1u32).unwrap();
        pool.dealloc(handle).unwrap();
        assert!(pool.dealloc(handle).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = Pool::with_capacity(2);
        pool.alloc(1).unwrap();
        pool.alloc(2).unwrap();
        assert_eq!(pool.alloc(3), Err(PoolError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn test_zero_capacity_pool() {
        let mut pool = Pool::<u8>::with_capacity(0);
        assert!(pool.is_full());
        assert!(pool.alloc(0).is_err());
    }

    #[test]
    fn test_handle_from_other_pool_is_invalid() {
        let mut big = Pool::with_capacity(8);
        let mut small = Pool::with_capacity(1);
        let mut last = big.alloc(0).unwrap();
        for i in 1..8 {
            last = big.alloc(i).unwrap();
        }
        small.alloc(0).unwrap();
        assert_eq!(small.get(last), Err(PoolError::InvalidHandle { index: 7 }));
    }

    #[test]
    fn test_get_mut_and_iter() {
        let mut pool = Pool::with_capacity(3);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        *pool.get_mut(b).unwrap() = 20;

        let mut values: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 20]);
        assert!(pool.contains(a));
    }

    #[test]
    fn test_drain_frees_everything() {
        let mut pool = Pool::with_capacity(4);
        let handles: Vec<_> = (0..3).map(|i| pool.alloc(i).unwrap()).collect();
        let mut drained = pool.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(pool.is_empty());
        assert!(handles.iter().all(|h| !pool.contains(*h)));

        // Full capacity is available again
        for i in 0..4 {
            pool.alloc(i).unwrap();
        }
        assert!(pool.is_full());
    }
}
