//! Page id → owning span index.
//!
//! A three-level radix tree over 36-bit page ids (48-bit addresses), 12 bits
//! per level. Interior and leaf nodes are 32 KiB arrays of atomic pointers
//! taken from [`os::system_alloc`]; fresh OS memory is zero-filled, which is
//! a valid array of null `AtomicPtr`s, so nodes need no initialization.
//!
//! Reads are lock-free (`Acquire`). Writes must be serialized by the caller;
//! the page cache performs them under its lock and publishes with `Release`.
//! Nodes are never freed.

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::config::PAGE_SHIFT;
use crate::error::AllocError;
use crate::os;
use crate::span::{PageId, Span};

const LEVEL_BITS: usize = 12;
const FANOUT: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = FANOUT - 1;

/// Page ids at or above this bound lie beyond 48-bit addresses.
const PAGE_ID_LIMIT: usize = 1 << (3 * LEVEL_BITS);

type Leaf = [AtomicPtr<Span>; FANOUT];
type Interior = [AtomicPtr<Leaf>; FANOUT];

const NODE_PAGES: usize = size_of::<Leaf>() >> PAGE_SHIFT;

pub(crate) struct PageMap {
    root: [AtomicPtr<Interior>; FANOUT],
}

fn split(page: PageId) -> Result<(usize, usize, usize), AllocError> {
    let raw = page.get();
    if raw >= PAGE_ID_LIMIT {
        return Err(AllocError::AddressOutOfRange { addr: page.addr() });
    }
    Ok((
        raw >> (2 * LEVEL_BITS),
        (raw >> LEVEL_BITS) & LEVEL_MASK,
        raw & LEVEL_MASK,
    ))
}

/// Claims a zeroed node from the OS.
fn new_node<T>() -> Result<*mut T, AllocError> {
    debug_assert_eq!(size_of::<T>(), NODE_PAGES << PAGE_SHIFT);
    let node = os::system_alloc(NODE_PAGES)?;
    log::debug!("page map claimed a {NODE_PAGES}-page node at {:p}", node.as_ptr());
    Ok(node.as_ptr().cast::<T>())
}

impl PageMap {
    pub(crate) const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; FANOUT],
        }
    }

    /// Looks up the span owning `page`.
    pub(crate) fn get(&self, page: PageId) -> Option<NonNull<Span>> {
        let (i, j, k) = split(page).ok()?;
        let interior = self.root[i].load(Ordering::Acquire);
        if interior.is_null() {
            return None;
        }
        // SAFETY: published nodes are never freed and were zero-filled on creation.
        let leaf = unsafe { (*interior)[j].load(Ordering::Acquire) };
        if leaf.is_null() {
            return None;
        }
        // SAFETY: as above.
        NonNull::new(unsafe { (*leaf)[k].load(Ordering::Acquire) })
    }

    /// Resolves the span owning the page that contains `addr`.
    pub(crate) fn resolve(&self, addr: usize) -> Result<NonNull<Span>, AllocError> {
        let page = PageId::from_addr(addr);
        split(page).map_err(|_| AllocError::AddressOutOfRange { addr })?;
        self.get(page).ok_or(AllocError::ForeignPointer { addr })
    }

    /// Points `page` at `span`, allocating intermediate nodes as needed.
    ///
    /// Callers must serialize writes.
    pub(crate) fn set(&self, page: PageId, span: NonNull<Span>) -> Result<(), AllocError> {
        let (i, j, k) = split(page)?;
        let mut interior = self.root[i].load(Ordering::Acquire);
        if interior.is_null() {
            interior = new_node::<Interior>()?;
            self.root[i].store(interior, Ordering::Release);
        }
        // SAFETY: `interior` is a live node; writers are serialized.
        let slot = unsafe { &(*interior)[j] };
        let mut leaf = slot.load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = new_node::<Leaf>()?;
            slot.store(leaf, Ordering::Release);
        }
        // SAFETY: `leaf` is a live node.
        unsafe { (*leaf)[k].store(span.as_ptr(), Ordering::Release) };
        Ok(())
    }

    /// Points every page of `[start, start + pages)` at `span`.
    pub(crate) fn set_range(
        &self,
        start: PageId,
        pages: usize,
        span: NonNull<Span>,
    ) -> Result<(), AllocError> {
        for n in 0..pages {
            self.set(start.offset(n), span)?;
        }
        Ok(())
    }

    /// Removes the entry for `page`. Missing nodes mean there is nothing to clear.
    pub(crate) fn clear(&self, page: PageId) {
        let Ok((i, j, k)) = split(page) else {
            return;
        };
        let interior = self.root[i].load(Ordering::Acquire);
        if interior.is_null() {
            return;
        }
        // SAFETY: published nodes are never freed.
        let leaf = unsafe { (*interior)[j].load(Ordering::Acquire) };
        if leaf.is_null() {
            return;
        }
        // SAFETY: as above.
        unsafe { (*leaf)[k].store(ptr::null_mut(), Ordering::Release) };
    }
}
