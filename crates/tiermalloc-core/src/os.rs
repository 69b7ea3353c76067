//! OS memory acquisition.
//!
//! Two primitives back every byte the allocator hands out:
//! - **Heap extension**: one large `PROT_NONE` reservation made on first use
//!   and committed front to back with `mprotect`, so successive chunks are
//!   address-contiguous the way `brk` growth is. Used for requests of at most
//!   [`MAX_PAGES`] pages (page-cache chunks, object-pool chunks, page-map
//!   nodes). It never collides with the C allocator's own `brk` use.
//! - **Anonymous mapping**: a private `mmap` sized exactly to the request and
//!   released with `munmap`. Used above [`MAX_PAGES`], and as the fallback
//!   when the heap region cannot be reserved or is exhausted.
//!
//! Memory from either primitive is page-aligned and zero-filled.

use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::config::{HEAP_RESERVE_BYTES, MAX_PAGES, PAGE_SHIFT};
use crate::error::{AllocError, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionState {
    Unreserved,
    Ready,
    Exhausted,
    Unavailable,
}

struct HeapRegion {
    base: usize,
    committed: usize,
    state: RegionState,
}

impl HeapRegion {
    const fn new() -> Self {
        Self {
            base: 0,
            committed: 0,
            state: RegionState::Unreserved,
        }
    }

    fn reserve(&mut self) {
        // SAFETY: anonymous, inaccessible, non-fixed mapping; no existing
        // memory is affected.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                HEAP_RESERVE_BYTES,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            log::warn!("heap region reservation failed; falling back to anonymous mappings");
            self.state = RegionState::Unavailable;
            return;
        }
        self.base = ptr as usize;
        self.state = RegionState::Ready;
        log::info!(
            "reserved {} MiB heap region at {:#x}",
            HEAP_RESERVE_BYTES >> 20,
            self.base
        );
    }

    fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        if self.state == RegionState::Unreserved {
            self.reserve();
        }
        if self.state != RegionState::Ready {
            return None;
        }
        if HEAP_RESERVE_BYTES - self.committed < len {
            log::warn!(
                "heap region exhausted after {} MiB; falling back to anonymous mappings",
                self.committed >> 20
            );
            self.state = RegionState::Exhausted;
            return None;
        }
        let addr = self.base + self.committed;
        // SAFETY: [addr, addr + len) lies inside our own reservation and has
        // never been handed out.
        let rc = unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return None;
        }
        self.committed += len;
        NonNull::new(addr as *mut u8)
    }
}

static HEAP_REGION: Mutex<HeapRegion> = Mutex::new(HeapRegion::new());

fn pages_to_bytes(pages: usize) -> Result<usize, AllocError> {
    pages
        .checked_mul(1 << PAGE_SHIFT)
        .ok_or(AllocError::SizeOverflow {
            size: pages.saturating_mul(1 << PAGE_SHIFT),
        })
}

/// Acquire `pages` fresh pages, choosing the primitive by size.
pub fn system_alloc(pages: usize) -> Result<NonNull<u8>, AllocError> {
    if pages > MAX_PAGES {
        map_anonymous(pages)
    } else {
        extend_heap(pages)
    }
}

/// Grow the heap region by `pages` pages.
pub fn extend_heap(pages: usize) -> Result<NonNull<u8>, AllocError> {
    let len = pages_to_bytes(pages)?;
    if let Some(ptr) = HEAP_REGION.lock().extend(len) {
        log::debug!("heap extended by {pages} pages at {:p}", ptr.as_ptr());
        return Ok(ptr);
    }
    map_anonymous(pages).map_err(|err| match err {
        AllocError::OutOfMemory { pages, .. } => AllocError::OutOfMemory {
            pages,
            primitive: Primitive::HeapExtension,
        },
        other => other,
    })
}

/// Map `pages` pages of private anonymous memory.
pub fn map_anonymous(pages: usize) -> Result<NonNull<u8>, AllocError> {
    let len = pages_to_bytes(pages)?;
    let oom = AllocError::OutOfMemory {
        pages,
        primitive: Primitive::AnonymousMap,
    };
    // SAFETY: anonymous, non-fixed mapping; no existing memory is affected.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(oom);
    }
    log::debug!("mapped {pages} pages at {ptr:p}");
    NonNull::new(ptr.cast::<u8>()).ok_or(oom)
}

/// Return an anonymous mapping to the OS.
///
/// # Safety
///
/// `ptr` and `pages` must describe exactly one live mapping obtained from
/// [`map_anonymous`], and no references into it may outlive this call.
pub unsafe fn unmap(ptr: NonNull<u8>, pages: usize) {
    // SAFETY: guaranteed by the caller.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), pages << PAGE_SHIFT) };
    if rc != 0 {
        log::warn!("munmap of {pages} pages at {:p} failed", ptr.as_ptr());
    } else {
        log::debug!("unmapped {pages} pages at {:p}", ptr.as_ptr());
    }
}
