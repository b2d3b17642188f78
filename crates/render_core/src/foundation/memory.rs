//! Memory management utilities
//!
//! Provides the scratch [`Arena`]: a fixed-capacity bump allocator used for
//! short-lived per-call data (barrier lists, extension name tables, temporary
//! vertex arrays). It is a stack, not a heap: allocations are released in
//! exact reverse order of creation.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use thiserror::Error;

/// Alignment of the arena's backing buffer
const ARENA_ALIGN: usize = 16;

/// Arena allocation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// Not enough space left for the request
    #[error("Arena exhausted: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory {
        /// Bytes needed including alignment padding
        requested: usize,
        /// Bytes left before the request
        remaining: usize,
    },
}

/// Fixed-capacity LIFO scratch allocator
///
/// Allocation returns an [`ArenaSlice`] guard; dropping the guard (or passing
/// it to [`Arena::dealloc`]) rewinds the cursor. Several guards may be live at
/// once, but they must be released newest-first. Releasing out of order is a
/// contract violation and panics, since the rewound range would overlap
/// memory that is still borrowed.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    cursor: Cell<usize>,
}

impl Arena {
    /// Create an arena with `capacity` bytes of backing storage
    pub fn new(capacity: usize) -> Self {
        let layout = match Layout::from_size_align(capacity, ARENA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("arena capacity overflow: {capacity} bytes"),
        };
        let base = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: layout has a non-zero size
            let ptr = unsafe { alloc::alloc(layout) };
            NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout))
        };

        log::debug!("Created scratch arena with {} bytes", layout.size());

        Self {
            base,
            layout,
            cursor: Cell::new(0),
        }
    }

    /// Allocate `count` default-initialized values of `T`
    ///
    /// Fails without moving the cursor when the request (including alignment
    /// padding) does not fit in the remaining capacity.
    pub fn alloc<T: Copy + Default>(&self, count: usize) -> Result<ArenaSlice<'_, T>, ArenaError> {
        let start = self.cursor.get();
        let remaining = self.remaining();

        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(ArenaError::OutOfMemory { requested: usize::MAX, remaining })?;

        if bytes == 0 {
            return Ok(ArenaSlice {
                arena: self,
                ptr: NonNull::dangling(),
                len: count,
                start,
                end: start,
                _marker: PhantomData,
            });
        }

        let address = self.base.as_ptr() as usize + start;
        let padding = address.wrapping_neg() & (mem::align_of::<T>() - 1);
        let requested = bytes
            .checked_add(padding)
            .ok_or(ArenaError::OutOfMemory { requested: usize::MAX, remaining })?;

        if requested > remaining {
            return Err(ArenaError::OutOfMemory { requested, remaining });
        }

        // SAFETY: start + padding + bytes <= capacity, and the padded address is
        // aligned for T. The range is not covered by any live guard because the
        // cursor only moves backwards when the newest guard is released.
        let ptr = unsafe {
            let ptr = self.base.as_ptr().add(start + padding).cast::<T>();
            for i in 0..count {
                ptr.add(i).write(T::default());
            }
            NonNull::new_unchecked(ptr)
        };

        let end = start + requested;
        self.cursor.set(end);

        Ok(ArenaSlice {
            arena: self,
            ptr,
            len: count,
            start,
            end,
            _marker: PhantomData,
        })
    }

    /// Release an allocation; equivalent to dropping the guard
    pub fn dealloc<T>(&self, allocation: ArenaSlice<'_, T>) {
        drop(allocation);
    }

    /// Rewind the arena to empty
    ///
    /// Takes `&mut self`, so no allocation can be outstanding.
    pub fn reset(&mut self) {
        self.cursor.set(0);
    }

    /// Bytes currently allocated, including padding
    pub fn used(&self) -> usize {
        self.cursor.get()
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor.get()
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn release(&self, start: usize, end: usize) {
        assert_eq!(
            self.cursor.get(),
            end,
            "arena allocations must be released in reverse order of allocation"
        );
        self.cursor.set(start);
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: base was allocated with this layout in `new`
            unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
        }
    }
}

/// Outstanding arena allocation
///
/// Dereferences to `[T]`. Rewinds the arena cursor when dropped.
pub struct ArenaSlice<'a, T> {
    arena: &'a Arena,
    ptr: NonNull<T>,
    len: usize,
    start: usize,
    end: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T> ArenaSlice<'_, T> {
    /// Byte offset of this allocation's end inside the arena
    pub fn end_offset(&self) -> usize {
        self.end
    }
}

impl<T> Deref for ArenaSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr/len describe an initialized, exclusively owned range
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ArenaSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above; &mut self guarantees uniqueness
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaSlice<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Drop for ArenaSlice<'_, T> {
    fn drop(&mut self) {
        self.arena.release(self.start, self.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic xorshift so fuzz sequences are reproducible
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_alloc_and_release_returns_cursor_to_zero() {
        let arena = Arena::new(1024);
        {
            let mut a = arena.alloc::<u32>(8).unwrap();
            a[0] = 7;
            assert_eq!(a.len(), 8);
            assert!(arena.used() >= 32);
            let b = arena.alloc::<u64>(4).unwrap();
            assert!(b.iter().all(|&v| v == 0));
            arena.dealloc(b);
            arena.dealloc(a);
        }
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_values_are_default_initialized() {
        let arena = Arena::new(256);
        let values = arena.alloc::<(u8, f32)>(10).unwrap();
        assert!(values.iter().all(|&(a, b)| a == 0 && b == 0.0));
    }

    #[test]
    fn test_alignment_is_respected() {
        let arena = Arena::new(256);
        let _byte = arena.alloc::<u8>(3).unwrap();
        let wide = arena.alloc::<u64>(2).unwrap();
        assert_eq!(wide.as_ptr() as usize % mem::align_of::<u64>(), 0);
    }

    #[test]
    fn test_oversized_request_leaves_cursor_intact() {
        let arena = Arena::new(64);
        let held = arena.alloc::<u8>(40).unwrap();
        let before = arena.used();

        let err = arena.alloc::<u8>(32).unwrap_err();
        assert_eq!(err, ArenaError::OutOfMemory { requested: 32, remaining: 24 });
        assert_eq!(arena.used(), before);

        // The arena is still usable after the failure
        let fits = arena.alloc::<u8>(24).unwrap();
        assert_eq!(arena.remaining(), 0);
        drop(fits);
        drop(held);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_overflowing_count_fails() {
        let arena = Arena::new(64);
        assert!(arena.alloc::<u64>(usize::MAX).is_err());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_zero_length_allocation() {
        let arena = Arena::new(16);
        let empty = arena.alloc::<u32>(0).unwrap();
        assert!(empty.is_empty());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_zero_capacity_arena_rejects_allocations() {
        let arena = Arena::new(0);
        assert_eq!(arena.capacity(), 0);
        assert!(arena.alloc::<u8>(1).is_err());
    }

    #[test]
    #[should_panic(expected = "reverse order")]
    fn test_non_lifo_release_panics() {
        let arena = Arena::new(128);
        let first = arena.alloc::<u32>(4).unwrap();
        let _second = arena.alloc::<u32>(4).unwrap();
        drop(first);
    }

    #[test]
    fn test_lifo_fuzz_balances() {
        let arena = Arena::new(4096);
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

        for _ in 0..200 {
            let mut stack = Vec::new();
            let depth = (rng.next() % 12) as usize;
            for _ in 0..depth {
                let count = (rng.next() % 64) as usize;
                let before = arena.used();
                match arena.alloc::<u32>(count) {
                    Ok(slice) => {
                        assert!(slice.end_offset() >= before + count * 4);
                        stack.push(slice);
                    }
                    Err(_) => assert_eq!(arena.used(), before),
                }
            }
            while let Some(slice) = stack.pop() {
                drop(slice);
            }
            assert_eq!(arena.used(), 0);
        }
    }

    #[test]
    fn test_live_allocations_do_not_overlap() {
        let arena = Arena::new(512);
        let mut a = arena.alloc::<u32>(16).unwrap();
        let mut b = arena.alloc::<u32>(16).unwrap();
        a.iter_mut().for_each(|v| *v = 1);
        b.iter_mut().for_each(|v| *v = 2);
        assert!(a.iter().all(|&v| v == 1));
        assert!(b.iter().all(|&v| v == 2));
    }

    #[test]
    fn test_reset() {
        let mut arena = Arena::new(64);
        std::mem::forget(arena.alloc::<u8>(10).unwrap());
        assert_eq!(arena.used(), 10);
        arena.reset();
        assert_eq!(arena.used(), 0);
    }
}
