//! Bump object pool for the allocator's own metadata.
//!
//! Span descriptors and thread caches must exist before the tiers they
//! describe can serve anything, so they are carved from chunks taken straight
//! from the OS primitive instead of from the allocator itself. Returned
//! objects go onto an intrusive reuse list (the link lives in the dead
//! object's first word) and are handed out again before the bump cursor
//! advances.
//!
//! The pool is unsynchronized; share it behind a `parking_lot::Mutex` and
//! hold that lock only around `create`/`destroy`.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::config::{OBJECT_POOL_CHUNK, PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;
use crate::free_list::{next_of, set_next};
use crate::os;

pub struct ObjectPool<T> {
    /// Next unclaimed byte of the current chunk (0 before the first chunk).
    cursor: usize,
    /// One past the last byte of the current chunk.
    end: usize,
    reuse: Option<NonNull<u8>>,
    live: usize,
    chunks: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the pool only holds addresses of memory it exclusively manages;
// handing it to another thread moves those objects with it.
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    const SLOT_ALIGN: usize = if align_of::<T>() > align_of::<*mut u8>() {
        align_of::<T>()
    } else {
        align_of::<*mut u8>()
    };

    const SLOT_SIZE: usize = {
        let raw = if size_of::<T>() > size_of::<*mut u8>() {
            size_of::<T>()
        } else {
            size_of::<*mut u8>()
        };
        (raw + Self::SLOT_ALIGN - 1) & !(Self::SLOT_ALIGN - 1)
    };

    pub const fn new() -> Self {
        Self {
            cursor: 0,
            end: 0,
            reuse: None,
            live: 0,
            chunks: 0,
            _marker: PhantomData,
        }
    }

    /// Moves `value` into a pool slot and returns its address.
    pub fn create(&mut self, value: T) -> Result<NonNull<T>, AllocError> {
        let slot = match self.reuse {
            Some(slot) => {
                // SAFETY: slots on the reuse list hold a link in their first word.
                self.reuse = unsafe { next_of(slot) };
                slot
            }
            None => self.bump()?,
        };
        let obj = slot.cast::<T>();
        // SAFETY: the slot is sized and aligned for `T` and unused.
        unsafe { obj.as_ptr().write(value) };
        self.live += 1;
        Ok(obj)
    }

    /// Drops the object in place and recycles its slot.
    ///
    /// # Safety
    ///
    /// `obj` must come from `create` on this pool, must not have been
    /// destroyed already, and must not be used afterwards.
    pub unsafe fn destroy(&mut self, obj: NonNull<T>) {
        // SAFETY: guaranteed by the caller.
        unsafe { obj.as_ptr().drop_in_place() };
        let slot = obj.cast::<u8>();
        // SAFETY: the slot is at least pointer-sized and pointer-aligned.
        unsafe { set_next(slot, self.reuse) };
        self.reuse = Some(slot);
        self.live -= 1;
    }

    /// Objects currently handed out.
    pub fn live(&self) -> usize {
        self.live
    }

    /// OS chunks claimed so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    fn bump(&mut self) -> Result<NonNull<u8>, AllocError> {
        let size = Self::SLOT_SIZE;
        let mut start = (self.cursor + Self::SLOT_ALIGN - 1) & !(Self::SLOT_ALIGN - 1);
        if self.cursor == 0 || start + size > self.end {
            let bytes = OBJECT_POOL_CHUNK.max((size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1));
            let pages = bytes >> PAGE_SHIFT;
            let chunk = os::system_alloc(pages)?;
            self.cursor = chunk.as_ptr() as usize;
            self.end = self.cursor + bytes;
            self.chunks += 1;
            start = self.cursor;
            log::debug!(
                "object pool claimed {pages} pages for {}-byte slots",
                Self::SLOT_SIZE
            );
        }
        self.cursor = start + size;
        // SAFETY: `start` lies inside a chunk returned as non-null by the OS layer.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
