//! Per-thread front end of the allocator.
//!
//! Each thread owns one free list per size class and touches it without any
//! lock. Misses refill from the central cache in batches whose size follows
//! an additive slow start (1, 2, 3, ... up to the class's batch limit);
//! frees drain a batch of exactly the current quota back once a list holds
//! that many blocks. The quota never exceeds the batch limit, so neither
//! direction moves more than [`MAX_BATCH`] blocks at once.
//!
//! [`MAX_BATCH`]: crate::size_class::MAX_BATCH

use std::ptr::NonNull;

use crate::allocator::Heap;
use crate::config::{MAX_SMALL_SIZE, NUM_SIZE_CLASSES};
use crate::error::AllocError;
use crate::free_list::{BlockChain, FreeList, next_of};
use crate::size_class::{self, SizeClass};

pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
    /// Blocks parked across all lists.
    cached: usize,
}

// SAFETY: the lists hold blocks owned by this cache alone; moving the cache
// to another thread (pool hand-out, thread exit) moves those blocks with it.
unsafe impl Send for ThreadCache {}

impl ThreadCache {
    /// Creates an empty cache with every quota at one block.
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            cached: 0,
        }
    }

    /// Allocates a block for a request of `size` bytes (at most
    /// [`MAX_SMALL_SIZE`]).
    pub fn allocate(&mut self, heap: &Heap, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size > MAX_SMALL_SIZE {
            return Err(AllocError::SizeOverflow { size });
        }
        let class = SizeClass::for_size(size.max(1));
        if let Some(block) = self.lists[class.index].pop() {
            self.cached -= 1;
            return Ok(block);
        }
        self.refill(heap, class)
    }

    fn refill(&mut self, heap: &Heap, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        let list = &mut self.lists[class.index];
        let want = list.quota().min(class.batch_limit);
        if list.quota() < class.batch_limit {
            list.grow_quota();
        }
        let chain = heap
            .central()
            .alloc_to_thread(heap.pages(), want, class.size)?;
        log::debug!(
            "thread cache refilled {} of {want} blocks of {} bytes",
            chain.len,
            class.size
        );
        if chain.len > 1 {
            // SAFETY: the chain holds `len` linked blocks.
            if let Some(next) = unsafe { next_of(chain.head) } {
                let rest = BlockChain {
                    head: next,
                    tail: chain.tail,
                    len: chain.len - 1,
                };
                // SAFETY: the blocks were just handed to us by the central cache.
                unsafe { list.push_chain(rest) };
                self.cached += rest.len;
            }
        }
        Ok(chain.head)
    }

    /// Takes back a block whose span serves `size`-byte blocks.
    ///
    /// # Safety
    ///
    /// `block` must have been allocated from `heap` with block size `size`
    /// and must not be used after this call.
    pub unsafe fn deallocate(
        &mut self,
        heap: &Heap,
        block: NonNull<u8>,
        size: usize,
    ) -> Result<(), AllocError> {
        let list = &mut self.lists[size_class::index(size)];
        // SAFETY: the caller hands the block back to us.
        unsafe { list.push(block) };
        self.cached += 1;
        if list.len() < list.quota() {
            return Ok(());
        }
        let quota = list.quota();
        let Some(chain) = list.pop_chain(quota) else {
            return Ok(());
        };
        self.cached -= chain.len;
        log::debug!("thread cache draining {} blocks of {size} bytes", chain.len);
        // SAFETY: every block in the chain came from the central cache for this class.
        unsafe { heap.central().recover_blocks(heap.pages(), chain, size) }
    }

    /// Returns every parked block to the central cache.
    pub fn release_all(&mut self, heap: &Heap) -> Result<(), AllocError> {
        for index in 0..NUM_SIZE_CLASSES {
            let len = self.lists[index].len();
            let Some(chain) = self.lists[index].pop_chain(len) else {
                continue;
            };
            self.cached -= chain.len;
            // SAFETY: parked blocks came from the central cache for this class.
            unsafe {
                heap.central()
                    .recover_blocks(heap.pages(), chain, size_class::class_size(index))?;
            }
        }
        log::debug!("thread cache released all parked blocks");
        Ok(())
    }

    /// Blocks parked across all classes.
    pub fn cached_blocks(&self) -> usize {
        self.cached
    }

    /// Blocks parked for class `index`.
    pub fn class_len(&self, index: usize) -> usize {
        self.lists.get(index).map_or(0, FreeList::len)
    }

    /// Current refill quota of class `index`.
    pub fn quota(&self, index: usize) -> usize {
        self.lists.get(index).map_or(0, FreeList::quota)
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}
