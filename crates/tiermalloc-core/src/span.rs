//! Spans (runs of contiguous pages) and the intrusive lists that bucket them.
//!
//! A span is owned by exactly one structure at a time: a page-cache bucket,
//! a central-cache bucket, or the thread moving it between the two. Its
//! `prev`/`next` links are only touched by whoever holds the lock of the
//! bucket it sits in.

use std::ptr::NonNull;

use crate::config::{MAX_PAGES, MAX_SMALL_SIZE, PAGE_SHIFT};
use crate::free_list::set_next;

/// Index of a 4 KiB page: an address shifted right by [`PAGE_SHIFT`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(usize);

impl PageId {
    /// Wraps a raw page number.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Page containing `addr`.
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr >> PAGE_SHIFT)
    }

    /// Raw page number.
    pub const fn get(self) -> usize {
        self.0
    }

    /// First byte of the page.
    pub const fn addr(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    /// The page `pages` pages after this one.
    pub const fn offset(self, pages: usize) -> Self {
        Self(self.0 + pages)
    }

    /// The page before this one, if any.
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

/// Descriptor for a run of pages, optionally cut into equal blocks.
///
/// `start`, `pages`, `block_size` and `in_use` are written only under the
/// page-cache lock. For small-block spans `free_head` and `in_use_blocks`
/// belong to the central bucket holding the span; for large allocations
/// `in_use_blocks` is set under the page-cache lock too. Concurrent code
/// touches a span through raw field places, never through a `&mut Span`
/// another thread could be reading.
#[derive(Debug)]
#[repr(C)]
pub struct Span {
    pub(crate) start: PageId,
    pub(crate) pages: usize,
    /// Block size served (0 while the span sits in the page cache; the span's
    /// byte length for large allocations).
    pub(crate) block_size: usize,
    /// Free blocks not currently handed to a thread cache.
    pub(crate) free_head: Option<NonNull<u8>>,
    /// Blocks currently handed out of the central cache.
    pub(crate) in_use_blocks: usize,
    /// Set while the span is owned by the central cache or a large allocation.
    pub(crate) in_use: bool,
    pub(crate) prev: Option<NonNull<Span>>,
    pub(crate) next: Option<NonNull<Span>>,
}

// SAFETY: a span's raw pointers address pages and neighbors that travel with
// it; every mutation happens under the lock of whichever tier owns the span.
unsafe impl Send for Span {}

impl Span {
    pub(crate) const fn new(start: PageId, pages: usize) -> Self {
        Self {
            start,
            pages,
            block_size: 0,
            free_head: None,
            in_use_blocks: 0,
            in_use: false,
            prev: None,
            next: None,
        }
    }

    /// First page of the run.
    pub fn start(&self) -> PageId {
        self.start
    }

    /// Length of the run in pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Last page of the run.
    pub fn last_page(&self) -> PageId {
        self.start.offset(self.pages - 1)
    }

    /// Size of the blocks the span serves; 0 while it is free.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently handed out of the span.
    pub fn in_use_blocks(&self) -> usize {
        self.in_use_blocks
    }

    /// Whether the span is owned by the central cache or a large allocation.
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// True for spans too large for any page-cache bucket.
    pub fn is_oversize(&self) -> bool {
        self.pages > MAX_PAGES
    }

    /// Address of the first byte.
    pub fn base_addr(&self) -> usize {
        self.start.addr()
    }

    /// Length of the run in bytes.
    pub fn byte_len(&self) -> usize {
        self.pages << PAGE_SHIFT
    }

    /// Whether `addr` falls inside the run.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr - self.base_addr() < self.byte_len()
    }

    /// Links the span's memory into a chain of blocks of its recorded block
    /// size. A trailing remainder smaller than one block is left unused.
    /// Returns the number of blocks.
    ///
    /// # Safety
    ///
    /// `span` must be live, in use and owned by the caller, with a non-zero
    /// block size that is a multiple of 8. Its pages must be mapped, writable,
    /// and not referenced by anyone else.
    pub(crate) unsafe fn carve(span: NonNull<Self>) -> usize {
        let p = span.as_ptr();
        // SAFETY: the page-lock fields of an in-use span no longer change.
        let (base, byte_len, block_size) =
            unsafe { ((*p).start.addr(), (*p).pages << PAGE_SHIFT, (*p).block_size) };
        debug_assert!(block_size >= 8 && block_size % 8 == 0);
        let count = byte_len / block_size;
        let mut next = None;
        for i in (0..count).rev() {
            let block = (base + i * block_size) as *mut u8;
            // SAFETY: the block lies inside the span's pages; `base` is non-zero
            // because it came from the OS.
            let block = unsafe { NonNull::new_unchecked(block) };
            // SAFETY: exclusive access to the span's memory is guaranteed by the caller.
            unsafe { set_next(block, next) };
            next = Some(block);
        }
        // SAFETY: the caller owns the span's block list.
        unsafe { (*p).free_head = next };
        count
    }
}

/// Immutable snapshot of a span's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    pub start: PageId,
    pub pages: usize,
    pub block_size: usize,
    pub in_use_blocks: usize,
    pub in_use: bool,
    pub oversize: bool,
}

impl SpanInfo {
    /// Reads the fields guarded by the page-cache lock. Outstanding blocks of
    /// a small-block span belong to its central bucket and read as 0 here.
    ///
    /// # Safety
    ///
    /// `span` must be live and those fields must hold still for the call:
    /// the caller holds the lock of the page cache that owns the span, or
    /// owns a live block of it.
    pub(crate) unsafe fn snapshot(span: NonNull<Span>) -> Self {
        let p = span.as_ptr();
        // SAFETY: these fields only change under the page-cache lock, which
        // cannot touch them while the caller's guarantee holds.
        let (start, pages, block_size, in_use) =
            unsafe { ((*p).start, (*p).pages, (*p).block_size, (*p).in_use) };
        let in_use_blocks = if block_size > MAX_SMALL_SIZE {
            // SAFETY: a large allocation's counter is set under the same lock.
            unsafe { (*p).in_use_blocks }
        } else {
            0
        };
        Self {
            start,
            pages,
            block_size,
            in_use_blocks,
            in_use,
            oversize: pages > MAX_PAGES,
        }
    }
}

impl From<&Span> for SpanInfo {
    fn from(span: &Span) -> Self {
        Self {
            start: span.start,
            pages: span.pages,
            block_size: span.block_size,
            in_use_blocks: span.in_use_blocks,
            in_use: span.in_use,
            oversize: span.is_oversize(),
        }
    }
}

/// Intrusive doubly-linked list of spans.
///
/// Ends are null-terminated rather than anchored on a sentinel so the list
/// can be built in a `const` context and live inside statics.
#[derive(Debug)]
pub(crate) struct SpanList {
    head: Option<NonNull<Span>>,
    len: usize,
}

// SAFETY: the list only stores addresses of spans it owns; whoever holds the
// list (behind a lock) has exclusive access to their links.
unsafe impl Send for SpanList {}

impl SpanList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Inserts `span` at the front.
    ///
    /// # Safety
    ///
    /// `span` must be live and must not be on any list.
    pub(crate) unsafe fn push_front(&mut self, span: NonNull<Span>) {
        // SAFETY: the caller gives us exclusive ownership of `span`; the
        // current head is owned by this list.
        unsafe {
            (*span.as_ptr()).prev = None;
            (*span.as_ptr()).next = self.head;
            if let Some(head) = self.head {
                (*head.as_ptr()).prev = Some(span);
            }
        }
        self.head = Some(span);
        self.len += 1;
        log::trace!("span list push, len={}", self.len);
    }

    /// Removes and returns the front span.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Span>> {
        let front = self.head?;
        // SAFETY: `front` is on this list.
        unsafe { self.remove(front) };
        Some(front)
    }

    /// Unlinks `span` in O(1).
    ///
    /// # Safety
    ///
    /// `span` must currently be on this list.
    pub(crate) unsafe fn remove(&mut self, span: NonNull<Span>) {
        // SAFETY: `span` and its neighbors are owned by this list.
        unsafe {
            let prev = (*span.as_ptr()).prev;
            let next = (*span.as_ptr()).next;
            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => self.head = next,
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = prev;
            }
            (*span.as_ptr()).prev = None;
            (*span.as_ptr()).next = None;
        }
        self.len -= 1;
        log::trace!("span list remove, len={}", self.len);
    }

    /// Iterates the spans front to back. The list must not change meanwhile.
    pub(crate) fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            cursor: self.head,
            _list: self,
        }
    }
}

pub(crate) struct SpanIter<'a> {
    cursor: Option<NonNull<Span>>,
    _list: &'a SpanList,
}

impl Iterator for SpanIter<'_> {
    type Item = NonNull<Span>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.cursor?;
        // SAFETY: the borrowed list keeps its spans linked while we walk it.
        self.cursor = unsafe { (*span.as_ptr()).next };
        Some(span)
    }
}
