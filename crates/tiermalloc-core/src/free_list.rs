//! Intrusive free lists of equal-size blocks.
//!
//! A free block stores the address of the next free block in its first
//! machine word, so the list costs no memory beyond the blocks themselves.
//! The link is only meaningful while the block is free; once handed to a
//! caller the word belongs to them.

use std::ptr::{self, NonNull};

/// Reads the link stored in a free block.
///
/// # Safety
///
/// `block` must point to a free block of at least one pointer in size,
/// aligned for a pointer, whose first word was written by [`set_next`].
#[inline]
pub(crate) unsafe fn next_of(block: NonNull<u8>) -> Option<NonNull<u8>> {
    // SAFETY: guaranteed by the caller.
    NonNull::new(unsafe { block.cast::<*mut u8>().read() })
}

/// Writes the link of a free block.
///
/// # Safety
///
/// `block` must be writable for one pointer and aligned for a pointer, and
/// nobody else may be using it.
#[inline]
pub(crate) unsafe fn set_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    let raw = next.map_or(ptr::null_mut(), NonNull::as_ptr);
    // SAFETY: guaranteed by the caller.
    unsafe { block.cast::<*mut u8>().write(raw) }
}

/// A detached, null-terminated run of free blocks moving between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChain {
    /// First block.
    pub head: NonNull<u8>,
    /// Last block; its link is null.
    pub tail: NonNull<u8>,
    /// Number of blocks in the chain (at least 1).
    pub len: usize,
}

/// Per-class list of free blocks with an adaptive refill quota.
#[derive(Debug)]
pub struct FreeList {
    head: Option<NonNull<u8>>,
    len: usize,
    /// Blocks to request on the next refill (slow start, grows by one).
    quota: usize,
}

impl FreeList {
    /// Creates an empty list with a refill quota of one block.
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            quota: 1,
        }
    }

    /// Whether no block is parked.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Blocks parked on the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Current refill quota.
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Raises the refill quota by one block.
    pub fn grow_quota(&mut self) {
        self.quota += 1;
        log::trace!("free list quota -> {}", self.quota);
    }

    /// Prepends one block.
    ///
    /// # Safety
    ///
    /// `block` must be an unused block of the list's class that nothing else
    /// references until it is popped again.
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        // SAFETY: the caller hands us exclusive use of `block`.
        unsafe { set_next(block, self.head) };
        self.head = Some(block);
        self.len += 1;
        log::trace!("free list push, len={}", self.len);
    }

    /// Prepends a whole chain in O(1).
    ///
    /// # Safety
    ///
    /// Every block of `chain` must satisfy the contract of [`FreeList::push`]
    /// and `chain.len` must be its true length.
    pub unsafe fn push_chain(&mut self, chain: BlockChain) {
        // SAFETY: the caller hands us exclusive use of the chain.
        unsafe { set_next(chain.tail, self.head) };
        self.head = Some(chain.head);
        self.len += chain.len;
        log::trace!("free list push {} blocks, len={}", chain.len, self.len);
    }

    /// Pops the most recently pushed block.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        // SAFETY: every block on the list was pushed as a free block.
        self.head = unsafe { next_of(block) };
        self.len -= 1;
        log::trace!("free list pop, len={}", self.len);
        Some(block)
    }

    /// Detaches the first `count` blocks as a terminated chain.
    ///
    /// Returns `None` if `count` is zero or exceeds the list length.
    pub fn pop_chain(&mut self, count: usize) -> Option<BlockChain> {
        if count == 0 || count > self.len {
            return None;
        }
        let head = self.head?;
        let mut tail = head;
        for _ in 1..count {
            // SAFETY: `count <= len`, so the first `count` links are populated.
            tail = unsafe { next_of(tail) }?;
        }
        // SAFETY: `tail` is a block on this list.
        self.head = unsafe { next_of(tail) };
        // SAFETY: `tail` now belongs to the detached chain only.
        unsafe { set_next(tail, None) };
        self.len -= count;
        log::trace!("free list pop {count} blocks, len={}", self.len);
        Some(BlockChain {
            head,
            tail,
            len: count,
        })
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Carves `backing` into 16-byte blocks.
    pub(crate) fn carve(backing: &mut [u64]) -> Vec<NonNull<u8>> {
        backing
            .chunks_exact_mut(2)
            .map(|pair| NonNull::from(&mut pair[0]).cast::<u8>())
            .collect()
    }

    #[test]
    fn new_list_is_empty() {
        let mut list = FreeList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_eq!(list.quota(), 1);
        assert!(list.pop().is_none());
        assert!(list.pop_chain(1).is_none());
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut backing = [0u64; 8];
        let blocks = carve(&mut backing);
        let mut list = FreeList::new();
        for &b in &blocks {
            // SAFETY: blocks are distinct, unused and outlive the list.
            unsafe { list.push(b) };
        }
        assert_eq!(list.len(), 4);
        for &b in blocks.iter().rev() {
            assert_eq!(list.pop(), Some(b));
        }
        assert!(list.is_empty());
    }

    #[test]
    fn pop_chain_detaches_prefix() {
        let mut backing = [0u64; 12];
        let blocks = carve(&mut backing);
        let mut list = FreeList::new();
        for &b in &blocks {
            // SAFETY: see push_pop_is_lifo.
            unsafe { list.push(b) };
        }

        let chain = list.pop_chain(4).unwrap();
        assert_eq!(chain.len, 4);
        assert_eq!(chain.head, blocks[5]);
        assert_eq!(chain.tail, blocks[2]);
        // SAFETY: the chain's tail is a free block we own.
        assert!(unsafe { next_of(chain.tail) }.is_none());
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(blocks[1]));

        assert!(list.pop_chain(2).is_none());
        assert_eq!(list.pop_chain(1).unwrap().head, blocks[0]);
    }

    #[test]
    fn push_chain_prepends_in_order() {
        let mut backing = [0u64; 10];
        let blocks = carve(&mut backing);
        let mut source = FreeList::new();
        let mut list = FreeList::new();
        // SAFETY: see push_pop_is_lifo.
        unsafe {
            list.push(blocks[0]);
            for &b in &blocks[1..] {
                source.push(b);
            }
        }
        let chain = source.pop_chain(4).unwrap();
        // SAFETY: the chain was detached from `source` and is ours.
        unsafe { list.push_chain(chain) };
        assert_eq!(list.len(), 5);
        let order: Vec<_> = std::iter::from_fn(|| list.pop()).collect();
        assert_eq!(
            order,
            vec![blocks[4], blocks[3], blocks[2], blocks[1], blocks[0]]
        );
    }

    #[test]
    fn quota_grows_by_one() {
        let mut list = FreeList::new();
        list.grow_quota();
        list.grow_quota();
        assert_eq!(list.quota(), 3);
    }
}
