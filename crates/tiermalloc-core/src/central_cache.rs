//! Shared per-class span pool between thread caches and the page cache.
//!
//! Each size class has its own bucket of spans carved into blocks of that
//! class, behind its own lock. A bucket lock is never held while the page
//! cache lock is taken: both paths that reach the page cache step out of the
//! bucket with `MutexGuard::unlocked` first.

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::config::NUM_SIZE_CLASSES;
use crate::error::AllocError;
use crate::free_list::{BlockChain, next_of, set_next};
use crate::page_cache::PageCache;
use crate::size_class;
use crate::span::{PageId, Span, SpanList};

pub struct CentralCache {
    buckets: [Mutex<SpanList>; NUM_SIZE_CLASSES],
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            buckets: [const { Mutex::new(SpanList::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Detaches up to `count` blocks of class size `size`, pulling a fresh
    /// span from `pages` if no bucketed span has a free block.
    ///
    /// The returned chain always holds at least one block.
    pub fn alloc_to_thread(
        &self,
        pages: &PageCache,
        count: usize,
        size: usize,
    ) -> Result<BlockChain, AllocError> {
        debug_assert!(count >= 1);
        let index = size_class::index(size);
        let mut bucket = self.buckets[index].lock();
        loop {
            let found = bucket
                .iter()
                // SAFETY: spans on the bucket are live while we hold its lock.
                .find(|span| unsafe { (*span.as_ptr()).free_head }.is_some());
            if let Some(span) = found {
                // SAFETY: as above; the lock gives us the span's block list.
                if let Some(chain) = unsafe { take_blocks(span, count) } {
                    log::debug!(
                        "central cache handed out {} blocks of {size} bytes",
                        chain.len
                    );
                    return Ok(chain);
                }
            }
            let span = MutexGuard::unlocked(&mut bucket, || fresh_span(pages, size))?;
            // SAFETY: the span came straight from the page cache and is on no list.
            unsafe { bucket.push_front(span) };
        }
    }

    /// Returns a chain of blocks of class size `size`. Spans whose last
    /// outstanding block comes back are handed to the page cache.
    ///
    /// # Safety
    ///
    /// Every block of `chain` must have been handed out by this cache for
    /// class size `size`, and must not be referenced after the call.
    pub unsafe fn recover_blocks(
        &self,
        pages: &PageCache,
        chain: BlockChain,
        size: usize,
    ) -> Result<(), AllocError> {
        let index = size_class::index(size);
        let mut bucket = self.buckets[index].lock();
        let mut cursor = Some(chain.head);
        let mut released = 0usize;
        while let Some(block) = cursor {
            // SAFETY: the chain is null-terminated and owned by us.
            cursor = unsafe { next_of(block) };
            let span = pages.span_of(block.as_ptr() as usize)?;
            let s = span.as_ptr();
            // SAFETY: a span with outstanding blocks is owned by this bucket,
            // whose lock we hold; the block is free again and belongs to it.
            let remaining = unsafe {
                debug_assert_eq!((*s).block_size, size);
                debug_assert!((*s).in_use_blocks > 0);
                set_next(block, (*s).free_head);
                (*s).free_head = Some(block);
                (*s).in_use_blocks -= 1;
                (*s).in_use_blocks
            };
            if remaining == 0 {
                // SAFETY: the span is on this bucket.
                unsafe { bucket.remove(span) };
                released += 1;
                MutexGuard::unlocked(&mut bucket, || {
                    // SAFETY: no block of the span is outstanding.
                    unsafe { pages.lock().recover_span(span) }
                })?;
            }
        }
        log::debug!(
            "central cache took back {} blocks of {size} bytes, released {released} spans",
            chain.len
        );
        Ok(())
    }

    /// Blocks of class `index` currently handed out.
    pub fn outstanding(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |bucket| {
            bucket
                .lock()
                .iter()
                // SAFETY: spans on the bucket are live while we hold its lock.
                .map(|span| unsafe { (*span.as_ptr()).in_use_blocks })
                .sum()
        })
    }

    /// Blocks handed out of the class-`size` span starting at `start`, or
    /// `None` if no such span is bucketed.
    pub fn span_outstanding(&self, size: usize, start: PageId) -> Option<usize> {
        let bucket = self.buckets[size_class::index(size)].lock();
        bucket
            .iter()
            // SAFETY: spans on the bucket are live while we hold its lock, and
            // the start of an in-use span never changes.
            .find(|span| unsafe { (*span.as_ptr()).start } == start)
            // SAFETY: as above.
            .map(|span| unsafe { (*span.as_ptr()).in_use_blocks })
    }

    /// Spans held for class `index`.
    pub fn span_count(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |bucket| bucket.lock().len())
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Takes a span for `size`-byte blocks from the page cache and carves it.
fn fresh_span(pages: &PageCache, size: usize) -> Result<NonNull<Span>, AllocError> {
    let span_pages = size_class::span_pages(size);
    let span = pages.lock().create_span_for(span_pages, size)?;
    // SAFETY: the span is in use and owned by us alone until it is bucketed.
    let blocks = unsafe { Span::carve(span) };
    log::debug!("central cache carved {span_pages} pages into {blocks} blocks of {size} bytes");
    Ok(span)
}

/// Detaches up to `count` blocks from the front of the span's free list.
///
/// # Safety
///
/// The caller must hold the lock of the bucket `span` sits in.
unsafe fn take_blocks(span: NonNull<Span>, count: usize) -> Option<BlockChain> {
    let s = span.as_ptr();
    // SAFETY: the bucket lock guards the span's block list.
    let head = unsafe { (*s).free_head }?;
    let mut tail = head;
    let mut len = 1;
    while len < count {
        // SAFETY: blocks on a span's free list hold valid links.
        match unsafe { next_of(tail) } {
            Some(next) => {
                tail = next;
                len += 1;
            }
            None => break,
        }
    }
    // SAFETY: `tail` is a free block of this span and now ends the detached
    // chain; the block list is ours under the bucket lock.
    unsafe {
        (*s).free_head = next_of(tail);
        set_next(tail, None);
        (*s).in_use_blocks += len;
    }
    Some(BlockChain { head, tail, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PAGES;

    fn blocks_of(chain: BlockChain) -> Vec<NonNull<u8>> {
        let mut out = Vec::new();
        let mut cursor = Some(chain.head);
        while let Some(block) = cursor {
            out.push(block);
            // SAFETY: chains handed out are null-terminated.
            cursor = unsafe { next_of(block) };
        }
        out
    }

    fn rechain(blocks: &[NonNull<u8>]) -> BlockChain {
        for pair in blocks.windows(2) {
            // SAFETY: the blocks are ours and unused.
            unsafe { set_next(pair[0], Some(pair[1])) };
        }
        let tail = blocks[blocks.len() - 1];
        // SAFETY: as above.
        unsafe { set_next(tail, None) };
        BlockChain {
            head: blocks[0],
            tail,
            len: blocks.len(),
        }
    }

    #[test]
    fn hands_out_requested_count() {
        let pages = PageCache::new();
        let central = CentralCache::new();
        let chain = central.alloc_to_thread(&pages, 10, 64).unwrap();
        assert_eq!(chain.len, 10);
        let blocks = blocks_of(chain);
        assert_eq!(blocks.len(), 10);
        assert_eq!(blocks[9], chain.tail);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.as_ptr() as usize % 64, 0);
            if i > 0 {
                assert_eq!(block.as_ptr() as usize, blocks[i - 1].as_ptr() as usize + 64);
            }
        }
        let index = size_class::index(64);
        assert_eq!(central.outstanding(index), 10);
        assert_eq!(central.span_count(index), 1);

        let span = pages.span_info(chain.head.as_ptr() as usize).unwrap();
        assert_eq!(span.block_size, 64);
        assert!(span.in_use);
        assert_eq!(central.span_outstanding(64, span.start), Some(10));
        assert_eq!(central.span_outstanding(128, span.start), None);
    }

    #[test]
    fn short_span_returns_fewer_blocks() {
        let pages = PageCache::new();
        let central = CentralCache::new();
        let size = 128 * 1024;
        assert_eq!(size_class::span_pages(size), 64);
        let first = central.alloc_to_thread(&pages, 5, size).unwrap();
        assert_eq!(first.len, 2);
        let second = central.alloc_to_thread(&pages, 5, size).unwrap();
        assert_eq!(second.len, 2);
        assert_eq!(central.span_count(size_class::index(size)), 2);
    }

    #[test]
    fn later_requests_reuse_the_same_span() {
        let pages = PageCache::new();
        let central = CentralCache::new();
        let a = central.alloc_to_thread(&pages, 3, 8).unwrap();
        let b = central.alloc_to_thread(&pages, 3, 8).unwrap();
        assert_eq!(central.span_count(0), 1);
        assert_eq!(central.outstanding(0), 6);
        assert_eq!(b.head.as_ptr() as usize, a.tail.as_ptr() as usize + 8);
    }

    #[test]
    fn recovering_every_block_returns_span_to_page_cache() {
        let pages = PageCache::new();
        let central = CentralCache::new();
        let chain = central.alloc_to_thread(&pages, 4, 8).unwrap();
        let blocks = blocks_of(chain);

        // SAFETY: the first two blocks came from this cache and are unused.
        unsafe { central.recover_blocks(&pages, rechain(&blocks[..2]), 8).unwrap() };
        assert_eq!(central.outstanding(0), 2);
        assert_eq!(central.span_count(0), 1);

        // SAFETY: as above.
        unsafe { central.recover_blocks(&pages, rechain(&blocks[2..]), 8).unwrap() };
        assert_eq!(central.outstanding(0), 0);
        assert_eq!(central.span_count(0), 0);
        assert_eq!(pages.free_spans(MAX_PAGES), 1);
    }

    #[test]
    fn returned_blocks_are_handed_out_again() {
        let pages = PageCache::new();
        let central = CentralCache::new();
        let keep = central.alloc_to_thread(&pages, 1, 32).unwrap();
        let chain = central.alloc_to_thread(&pages, 1, 32).unwrap();
        // SAFETY: the block came from this cache and is unused.
        unsafe { central.recover_blocks(&pages, chain, 32).unwrap() };
        let again = central.alloc_to_thread(&pages, 1, 32).unwrap();
        assert_eq!(again.head, chain.head);
        assert_ne!(again.head, keep.head);
    }

    #[test]
    fn out_of_range_index_reports_nothing() {
        let central = CentralCache::new();
        assert_eq!(central.outstanding(NUM_SIZE_CLASSES), 0);
        assert_eq!(central.span_count(NUM_SIZE_CLASSES), 0);
    }
}
