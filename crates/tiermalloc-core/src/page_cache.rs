//! Page-granular span allocator.
//!
//! Free spans sit in one bucket per page count (1..=`MAX_PAGES`). Requests
//! take the exact bucket, else split the smallest larger span, else grow by a
//! `MAX_PAGES`-page chunk from the heap-extension primitive and retry.
//! Returned spans coalesce with free neighbors on both sides, up to
//! `MAX_PAGES` pages. Runs above `MAX_PAGES` bypass the buckets entirely and
//! go straight to (and back to) an anonymous mapping.
//!
//! Every page of a bucketed or in-use span is registered in the page map, so
//! any address inside managed memory resolves to its current owner. Oversize
//! spans register only their first and last page.

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{MAX_PAGES, MAX_SMALL_SIZE};
use crate::error::AllocError;
use crate::object_pool::ObjectPool;
use crate::os;
use crate::page_map::PageMap;
use crate::span::{PageId, Span, SpanInfo, SpanList};

struct PageState {
    /// `buckets[n]` holds free spans of exactly `n` pages; index 0 is unused.
    buckets: [SpanList; MAX_PAGES + 1],
    span_pool: ObjectPool<Span>,
}

/// The page-level tier shared by every central-cache bucket of a heap.
pub struct PageCache {
    state: Mutex<PageState>,
    map: PageMap,
}

/// Exclusive access to a [`PageCache`]'s buckets and span pool.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, PageState>,
    map: &'a PageMap,
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(PageState {
                buckets: [const { SpanList::new() }; MAX_PAGES + 1],
                span_pool: ObjectPool::new(),
            }),
            map: PageMap::new(),
        }
    }

    /// Takes the page-cache lock.
    pub fn lock(&self) -> PageGuard<'_> {
        PageGuard {
            state: self.state.lock(),
            map: &self.map,
        }
    }

    /// Resolves the span owning `addr` without taking the lock.
    pub fn span_of(&self, addr: usize) -> Result<NonNull<Span>, AllocError> {
        self.map.resolve(addr)
    }

    /// Snapshot of the span owning `addr`, taken under the lock. Outstanding
    /// blocks of small-block spans are not tracked here and read as 0.
    pub fn span_info(&self, addr: usize) -> Result<SpanInfo, AllocError> {
        let _state = self.state.lock();
        let span = self.map.resolve(addr)?;
        // SAFETY: with the lock held the map only points at live descriptors.
        Ok(unsafe { SpanInfo::snapshot(span) })
    }

    /// Free spans of exactly `pages` pages.
    pub fn free_spans(&self, pages: usize) -> usize {
        self.lock().free_spans(pages)
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageGuard<'_> {
    /// Hands out a span of exactly `pages` pages, marked in use.
    ///
    /// The caller owns the span until it passes it to [`recover_span`].
    ///
    /// [`recover_span`]: PageGuard::recover_span
    pub fn create_span(&mut self, pages: usize) -> Result<NonNull<Span>, AllocError> {
        debug_assert!(pages > 0);
        if pages > MAX_PAGES {
            return self.create_oversize(pages);
        }
        loop {
            if let Some(span) = self.state.buckets[pages].pop_front() {
                // SAFETY: popped spans are live and owned by us now.
                unsafe { (*span.as_ptr()).in_use = true };
                return Ok(span);
            }

            if let Some(larger) = (pages + 1..=MAX_PAGES)
                .find_map(|n| self.state.buckets[n].pop_front())
            {
                return self.split_front(larger, pages);
            }

            let chunk = os::extend_heap(MAX_PAGES)?;
            let start = PageId::from_addr(chunk.as_ptr() as usize);
            let span = self.new_span(start, MAX_PAGES)?;
            self.map.set_range(start, MAX_PAGES, span)?;
            // SAFETY: `span` is fresh and on no list.
            unsafe { self.state.buckets[MAX_PAGES].push_front(span) };
            log::debug!(
                "page cache grew by {MAX_PAGES} pages at {:p}",
                chunk.as_ptr()
            );
        }
    }

    /// Like [`create_span`], also recording the size of the blocks the span
    /// will serve. A block size above [`MAX_SMALL_SIZE`] marks a large
    /// allocation, whose single block counts as handed out.
    ///
    /// [`create_span`]: PageGuard::create_span
    pub fn create_span_for(
        &mut self,
        pages: usize,
        block_size: usize,
    ) -> Result<NonNull<Span>, AllocError> {
        let span = self.create_span(pages)?;
        // SAFETY: the span was just handed out and nobody else can see it.
        unsafe {
            (*span.as_ptr()).block_size = block_size;
            if block_size > MAX_SMALL_SIZE {
                (*span.as_ptr()).in_use_blocks = 1;
            }
        }
        Ok(span)
    }

    fn create_oversize(&mut self, pages: usize) -> Result<NonNull<Span>, AllocError> {
        let base = os::map_anonymous(pages)?;
        let start = PageId::from_addr(base.as_ptr() as usize);
        let span = match self.new_span(start, pages) {
            Ok(span) => span,
            Err(err) => {
                // SAFETY: the mapping was just created and nothing references it.
                unsafe { os::unmap(base, pages) };
                return Err(err);
            }
        };
        // SAFETY: `span` is fresh.
        unsafe { (*span.as_ptr()).in_use = true };
        self.map.set(start, span)?;
        self.map.set(start.offset(pages - 1), span)?;
        log::debug!("page cache mapped oversize span of {pages} pages");
        Ok(span)
    }

    /// Cuts the first `pages` pages off `larger` and re-buckets the rest.
    fn split_front(
        &mut self,
        larger: NonNull<Span>,
        pages: usize,
    ) -> Result<NonNull<Span>, AllocError> {
        // SAFETY: `larger` was just popped; we own it.
        let rest = unsafe { &mut *larger.as_ptr() };
        let start = rest.start;
        let front = match self.new_span(start, pages) {
            Ok(front) => front,
            Err(err) => {
                // SAFETY: `larger` is on no list.
                unsafe { self.state.buckets[rest.pages].push_front(larger) };
                return Err(err);
            }
        };
        rest.start = start.offset(pages);
        rest.pages -= pages;
        // The remainder's pages already resolve to `larger`.
        // SAFETY: `larger` is on no list.
        unsafe { self.state.buckets[rest.pages].push_front(larger) };
        self.map.set_range(start, pages, front)?;
        // SAFETY: `front` is fresh.
        unsafe { (*front.as_ptr()).in_use = true };
        log::debug!(
            "page cache split {} pages into {pages} + {}",
            pages + rest.pages,
            rest.pages
        );
        Ok(front)
    }

    fn new_span(&mut self, start: PageId, pages: usize) -> Result<NonNull<Span>, AllocError> {
        self.state.span_pool.create(Span::new(start, pages))
    }

    /// Takes back a span handed out by [`create_span`], merging it with free
    /// neighbors. Oversize spans are unmapped instead.
    ///
    /// # Safety
    ///
    /// `span` must have come from `create_span` on this cache, must be on no
    /// list, and no block inside it may be referenced any more.
    ///
    /// [`create_span`]: PageGuard::create_span
    pub unsafe fn recover_span(&mut self, span: NonNull<Span>) -> Result<(), AllocError> {
        // SAFETY: the caller returns ownership of `span` to us.
        let s = unsafe { &mut *span.as_ptr() };
        if s.is_oversize() {
            let (start, pages) = (s.start, s.pages);
            self.map.clear(start);
            self.map.clear(start.offset(pages - 1));
            // SAFETY: the descriptor is not referenced any more.
            unsafe { self.state.span_pool.destroy(span) };
            if let Some(base) = NonNull::new(start.addr() as *mut u8) {
                // SAFETY: oversize spans own exactly one anonymous mapping.
                unsafe { os::unmap(base, pages) };
            }
            log::debug!("page cache released oversize span of {pages} pages");
            return Ok(());
        }

        while let Some(left) = s.start.prev().and_then(|page| self.map.get(page)) {
            // SAFETY: map entries point at live descriptors while we hold the
            // lock. An in-use neighbor may have its block list changed by a
            // central bucket, so only the fields this lock guards are read.
            let (start, pages, in_use) = unsafe {
                (
                    (*left.as_ptr()).start,
                    (*left.as_ptr()).pages,
                    (*left.as_ptr()).in_use,
                )
            };
            if left == span || in_use || pages + s.pages > MAX_PAGES {
                break;
            }
            debug_assert_eq!(start.offset(pages), s.start);
            // SAFETY: free spans always sit in the bucket for their page count.
            unsafe { self.state.buckets[pages].remove(left) };
            self.map.set_range(start, pages, span)?;
            // SAFETY: `left` is unlinked and unreferenced.
            unsafe { self.state.span_pool.destroy(left) };
            s.start = start;
            s.pages += pages;
            log::debug!("page cache merged {pages} pages from the left, now {}", s.pages);
        }

        while let Some(right) = self.map.get(s.start.offset(s.pages)) {
            // SAFETY: as above.
            let (start, pages, in_use) = unsafe {
                (
                    (*right.as_ptr()).start,
                    (*right.as_ptr()).pages,
                    (*right.as_ptr()).in_use,
                )
            };
            if right == span || in_use || pages + s.pages > MAX_PAGES {
                break;
            }
            debug_assert_eq!(start, s.start.offset(s.pages));
            // SAFETY: as above.
            unsafe { self.state.buckets[pages].remove(right) };
            self.map.set_range(start, pages, span)?;
            // SAFETY: as above.
            unsafe { self.state.span_pool.destroy(right) };
            s.pages += pages;
            log::debug!("page cache merged {pages} pages from the right, now {}", s.pages);
        }

        s.in_use = false;
        s.block_size = 0;
        s.free_head = None;
        s.in_use_blocks = 0;
        // SAFETY: `span` is on no list.
        unsafe { self.state.buckets[s.pages].push_front(span) };
        Ok(())
    }

    /// Free spans of exactly `pages` pages.
    pub fn free_spans(&self, pages: usize) -> usize {
        self.state.buckets.get(pages).map_or(0, SpanList::len)
    }

    /// Total pages held in the buckets.
    pub fn free_pages(&self) -> usize {
        self.state
            .buckets
            .iter()
            .enumerate()
            .map(|(pages, bucket)| pages * bucket.len())
            .sum()
    }

    /// Span descriptors currently live in this cache's pool.
    pub fn live_spans(&self) -> usize {
        self.state.span_pool.live()
    }
}
