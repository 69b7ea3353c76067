//! Heap wiring and process-wide entry points.
//!
//! A [`Heap`] owns one central cache and one page cache. The process heap is
//! a `static` built at compile time; each thread reaches it through a lazily
//! created [`ThreadCache`] drawn from a shared object pool and drained back
//! when the thread exits. Calls that arrive after this thread's cache has
//! been torn down, or while it is already in use further up the stack, take
//! the uncached path straight to the central cache.

use std::cell::Cell;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::central_cache::CentralCache;
use crate::config::{MAX_SMALL_SIZE, PAGE_SHIFT, validation_level};
use crate::error::{AllocError, fatal};
use crate::free_list::{BlockChain, set_next};
use crate::object_pool::ObjectPool;
use crate::page_cache::PageCache;
use crate::size_class::{SizeClass, large_pages};
use crate::span::{Span, SpanInfo};
use crate::thread_cache::ThreadCache;

/// One independent allocator instance.
///
/// Memory is never returned to the OS except for oversize spans, so a
/// dropped heap leaks its pages.
pub struct Heap {
    central: CentralCache,
    pages: PageCache,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            central: CentralCache::new(),
            pages: PageCache::new(),
        }
    }

    pub fn central(&self) -> &CentralCache {
        &self.central
    }

    pub fn pages(&self) -> &PageCache {
        &self.pages
    }

    /// Allocates `size` bytes (0 is treated as 1) through `cache`.
    pub fn allocate_with(
        &self,
        cache: &mut ThreadCache,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let size = size.max(1);
        if size <= MAX_SMALL_SIZE {
            cache.allocate(self, size)
        } else {
            self.allocate_large(size)
        }
    }

    /// Frees `ptr` through `cache`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since.
    /// `cache` must be the cache small blocks are parked in for this heap.
    pub unsafe fn deallocate_with(
        &self,
        cache: &mut ThreadCache,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        let span = self.owner(ptr)?;
        // SAFETY: the caller owns a block of `span`, which keeps it live and
        // its block size fixed.
        let block_size = unsafe { (*span.as_ptr()).block_size };
        if block_size > MAX_SMALL_SIZE {
            // SAFETY: a large allocation is the span's only block.
            unsafe { self.release_large(span) }
        } else {
            // SAFETY: forwarded from the caller.
            unsafe { cache.deallocate(self, ptr, block_size) }
        }
    }

    /// Allocates without a thread cache, one block at a time.
    pub fn allocate_uncached(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = size.max(1);
        if size > MAX_SMALL_SIZE {
            return self.allocate_large(size);
        }
        let class = SizeClass::for_size(size);
        let chain = self.central.alloc_to_thread(&self.pages, 1, class.size)?;
        Ok(chain.head)
    }

    /// Frees without a thread cache, returning the block straight to the
    /// central cache.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate_with`].
    pub unsafe fn deallocate_uncached(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let span = self.owner(ptr)?;
        // SAFETY: see `deallocate_with`.
        let block_size = unsafe { (*span.as_ptr()).block_size };
        if block_size > MAX_SMALL_SIZE {
            // SAFETY: see `deallocate_with`.
            return unsafe { self.release_large(span) };
        }
        // SAFETY: the block is ours to relink.
        unsafe { set_next(ptr, None) };
        let chain = BlockChain {
            head: ptr,
            tail: ptr,
            len: 1,
        };
        // SAFETY: forwarded from the caller.
        unsafe { self.central.recover_blocks(&self.pages, chain, block_size) }
    }

    /// Checks that `ptr` is the start of a live block of this heap. Any
    /// address may be passed; the owner is resolved under the page-cache lock.
    pub fn validate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let info = self.pages.span_info(ptr.as_ptr() as usize)?;
        check_block(ptr, &info)
    }

    /// Bytes usable at `ptr` (its block size). Checked like [`Heap::validate`].
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        let info = self.pages.span_info(ptr.as_ptr() as usize)?;
        check_block(ptr, &info)?;
        Ok(info.block_size)
    }

    /// Block size at `ptr` without taking any lock.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn block_size_of(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        let span = self.owner(ptr)?;
        // SAFETY: the caller's live block keeps the span and its block size fixed.
        Ok(unsafe { (*span.as_ptr()).block_size })
    }

    /// Snapshot of the span that owns `ptr`, including the blocks handed out
    /// of it.
    pub fn span_info(&self, ptr: NonNull<u8>) -> Result<SpanInfo, AllocError> {
        let mut info = self.pages.span_info(ptr.as_ptr() as usize)?;
        if info.in_use && info.block_size != 0 && info.block_size <= MAX_SMALL_SIZE {
            info.in_use_blocks = self
                .central
                .span_outstanding(info.block_size, info.start)
                .unwrap_or(0);
        }
        Ok(info)
    }

    fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let pages = large_pages(size)?;
        let span = self.pages.lock().create_span_for(pages, pages << PAGE_SHIFT)?;
        // SAFETY: the span was just handed to us; its start no longer changes.
        let base = unsafe { (*span.as_ptr()).start }.addr();
        log::debug!("large allocation of {size} bytes took {pages} pages");
        // SAFETY: span memory comes from the OS and is never at address 0.
        Ok(unsafe { NonNull::new_unchecked(base as *mut u8) })
    }

    /// # Safety
    ///
    /// `span` must be a large allocation whose memory is no longer used.
    unsafe fn release_large(&self, span: NonNull<Span>) -> Result<(), AllocError> {
        // SAFETY: forwarded from the caller.
        unsafe { self.pages.lock().recover_span(span) }
    }

    fn owner(&self, ptr: NonNull<u8>) -> Result<NonNull<Span>, AllocError> {
        if validation_level().checks_enabled() {
            self.checked_owner(ptr)
        } else {
            self.pages.span_of(ptr.as_ptr() as usize)
        }
    }

    /// Lock-free owner lookup with block checks, for pointers the caller
    /// claims are live.
    fn checked_owner(&self, ptr: NonNull<u8>) -> Result<NonNull<Span>, AllocError> {
        let span = self.pages.span_of(ptr.as_ptr() as usize)?;
        // SAFETY: a live block pins its span's page-lock fields. For a stale
        // pointer the read is as unreliable as the pointer itself.
        let info = unsafe { SpanInfo::snapshot(span) };
        check_block(ptr, &info)?;
        Ok(span)
    }
}

/// Checks that `ptr` starts a block of the in-use span described by `info`.
fn check_block(ptr: NonNull<u8>, info: &SpanInfo) -> Result<(), AllocError> {
    let addr = ptr.as_ptr() as usize;
    let base = info.start.addr();
    let inside = addr >= base && addr - base < (info.pages << PAGE_SHIFT);
    if !info.in_use || info.block_size == 0 || !inside {
        return Err(AllocError::SpanNotInUse { addr });
    }
    if (addr - base) % info.block_size != 0 {
        return Err(AllocError::MisalignedBlock {
            addr,
            block_size: info.block_size,
        });
    }
    Ok(())
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_HEAP: Heap = Heap::new();

static CACHE_POOL: Mutex<ObjectPool<ThreadCache>> = Mutex::new(ObjectPool::new());

/// The process-wide heap.
pub fn global() -> &'static Heap {
    &GLOBAL_HEAP
}

struct CacheSlot {
    cache: Cell<Option<NonNull<ThreadCache>>>,
    busy: Cell<bool>,
}

impl CacheSlot {
    const fn new() -> Self {
        Self {
            cache: Cell::new(None),
            busy: Cell::new(false),
        }
    }

    fn lease(&self) -> Option<CacheLease> {
        if self.busy.get() {
            return None;
        }
        let cache = match self.cache.get() {
            Some(cache) => cache,
            None => {
                let cache = CACHE_POOL.lock().create(ThreadCache::new()).ok()?;
                self.cache.set(Some(cache));
                log::debug!("thread cache created at {:p}", cache.as_ptr());
                cache
            }
        };
        self.busy.set(true);
        Some(CacheLease(cache))
    }
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        let Some(cache) = self.cache.take() else {
            return;
        };
        self.busy.set(true);
        // SAFETY: the thread is exiting; nothing else can reach its cache.
        if let Err(err) = unsafe { (*cache.as_ptr()).release_all(global()) } {
            fatal(err);
        }
        // SAFETY: the cache came from this pool and is not referenced any more.
        unsafe { CACHE_POOL.lock().destroy(cache) };
        log::debug!("thread cache returned to the pool");
    }
}

thread_local! {
    static THREAD_CACHE: CacheSlot = const { CacheSlot::new() };
}

/// Exclusive use of the calling thread's cache until dropped.
struct CacheLease(NonNull<ThreadCache>);

impl Drop for CacheLease {
    fn drop(&mut self) {
        let _ = THREAD_CACHE.try_with(|slot| slot.busy.set(false));
    }
}

#[inline]
fn lease_thread_cache() -> Option<CacheLease> {
    THREAD_CACHE.try_with(CacheSlot::lease).ok().flatten()
}

/// Allocates `size` bytes from the process heap. Aborts on failure.
pub fn allocate(size: usize) -> NonNull<u8> {
    let heap = global();
    let result = match lease_thread_cache() {
        // SAFETY: the lease grants exclusive use of this thread's cache.
        Some(lease) => heap.allocate_with(unsafe { &mut *lease.0.as_ptr() }, size),
        None => heap.allocate_uncached(size),
    };
    result.unwrap_or_else(|err| fatal(err))
}

/// Frees a pointer returned by [`allocate`]. Aborts on a pointer this
/// allocator does not own (or, under strict validation, one that does not
/// start a live block).
///
/// # Safety
///
/// `ptr` must not be used after this call.
pub unsafe fn deallocate(ptr: NonNull<u8>) {
    let heap = global();
    let result = match lease_thread_cache() {
        // SAFETY: the lease grants exclusive use of this thread's cache; the
        // pointer contract is forwarded from the caller.
        Some(lease) => unsafe { heap.deallocate_with(&mut *lease.0.as_ptr(), ptr) },
        // SAFETY: forwarded from the caller.
        None => unsafe { heap.deallocate_uncached(ptr) },
    };
    if let Err(err) = result {
        fatal(err);
    }
}

/// Bytes usable at a pointer returned by [`allocate`]. Aborts on a foreign
/// pointer.
pub fn usable_size(ptr: NonNull<u8>) -> usize {
    global().usable_size(ptr).unwrap_or_else(|err| fatal(err))
}

/// Parked blocks in the calling thread's cache, or 0 if it has none.
pub fn thread_cached_blocks() -> usize {
    lease_thread_cache()
        // SAFETY: the lease grants exclusive use of this thread's cache.
        .map_or(0, |lease| unsafe { lease.0.as_ref() }.cached_blocks())
}
