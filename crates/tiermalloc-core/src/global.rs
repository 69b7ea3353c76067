//! [`GlobalAlloc`] adapter over the process heap.
//!
//! Class sizes are multiples of their band alignment and spans start on page
//! boundaries, so padding a request up to a multiple of its alignment is
//! enough to honor any alignment up to [`PAGE_SIZE`]. Larger alignments are
//! refused with a null pointer.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};

use crate::allocator::{allocate, deallocate, global};
use crate::config::PAGE_SIZE;
use crate::error::fatal;

/// Zero-sized handle implementing [`GlobalAlloc`] on top of [`allocate`] and
/// [`deallocate`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TierMalloc;

/// Request size that yields a block aligned for `layout`, or `None` when the
/// alignment cannot be honored.
fn padded_size(layout: Layout) -> Option<usize> {
    let align = layout.align();
    if align > PAGE_SIZE {
        return None;
    }
    let size = layout.size().max(1);
    size.checked_add(align - 1).map(|padded| padded & !(align - 1))
}

// SAFETY: every block returned is at least `padded_size(layout)` bytes and
// aligned to `layout.align()`; `dealloc` only accepts pointers from `alloc`.
unsafe impl GlobalAlloc for TierMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match padded_size(layout) {
            Some(size) => allocate(size).as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: forwarded from the caller.
            unsafe { deallocate(ptr) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded from the caller.
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // SAFETY: the block holds at least `layout.size()` bytes.
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        // SAFETY: `new_size` with the old alignment is valid per the trait contract.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let Some(wanted) = padded_size(new_layout) else {
            return ptr::null_mut();
        };
        // SAFETY: `ptr` is live per the trait contract.
        let usable = unsafe { global().block_size_of(old) }.unwrap_or_else(|err| fatal(err));
        if wanted <= usable {
            return ptr;
        }
        // SAFETY: `new_layout` has a non-zero size and a valid alignment.
        let fresh = unsafe { self.alloc(new_layout) };
        if !fresh.is_null() {
            // SAFETY: both blocks are live, distinct and at least `layout.size()`
            // bytes long (the new one is larger than the old usable size).
            unsafe {
                ptr::copy_nonoverlapping(ptr, fresh, layout.size());
                self.dealloc(ptr, layout);
            }
        }
        fresh
    }
}
