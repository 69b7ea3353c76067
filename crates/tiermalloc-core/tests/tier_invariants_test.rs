use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use tiermalloc_core::config::{MAX_PAGES, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, PAGE_SIZE};
use tiermalloc_core::size_class::{self, SizeClass};
use tiermalloc_core::{AllocError, Heap, ThreadCache, validation_level};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }

    /// Mostly small sizes, some medium, rare large.
    fn gen_size(&mut self) -> usize {
        match self.gen_range(0, 99) {
            0..=1 => self.gen_range(MAX_SMALL_SIZE + 1, 4 * MAX_SMALL_SIZE),
            2..=19 => self.gen_range(1025, MAX_SMALL_SIZE),
            _ => self.gen_range(1, 1024),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct AllocationRec {
    ptr: NonNull<u8>,
    requested_size: usize,
    tag: u8,
}

fn expected_block_size(size: usize) -> usize {
    if size <= MAX_SMALL_SIZE {
        size_class::round_up(size.max(1))
    } else {
        size.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

fn fill(rec: &AllocationRec) {
    // SAFETY: the block holds at least `requested_size` bytes.
    unsafe { rec.ptr.as_ptr().write_bytes(rec.tag, rec.requested_size) };
}

fn check(rec: &AllocationRec) {
    // SAFETY: the block is live and was filled by `fill`.
    let bytes = unsafe { std::slice::from_raw_parts(rec.ptr.as_ptr(), rec.requested_size) };
    assert!(
        bytes.iter().all(|&b| b == rec.tag),
        "block at {:p} ({} bytes) was overwritten",
        rec.ptr.as_ptr(),
        rec.requested_size
    );
}

#[test]
fn three_small_blocks_then_reuse() {
    let heap = Heap::new();
    let mut cache = ThreadCache::new();

    let p1 = heap.allocate_with(&mut cache, 5).unwrap();
    let p2 = heap.allocate_with(&mut cache, 5).unwrap();
    let p3 = heap.allocate_with(&mut cache, 5).unwrap();
    assert_ne!(p1, p2);
    assert_ne!(p2, p3);
    assert_ne!(p1, p3);
    for p in [p1, p2, p3] {
        assert_eq!(heap.usable_size(p).unwrap(), 8);
    }

    // SAFETY: each pointer came from this heap and is freed once.
    unsafe {
        heap.deallocate_with(&mut cache, p1).unwrap();
        heap.deallocate_with(&mut cache, p2).unwrap();
        heap.deallocate_with(&mut cache, p3).unwrap();
    }
    let again = heap.allocate_with(&mut cache, 5).unwrap();
    assert!([p1, p2, p3].contains(&again));
    assert_eq!(again, p1);
}

#[test]
fn lifo_reuse_on_a_fresh_thread() {
    std::thread::spawn(|| {
        let a = tiermalloc_core::allocate(40);
        // SAFETY: `a` was just allocated.
        unsafe { tiermalloc_core::deallocate(a) };
        let b = tiermalloc_core::allocate(40);
        assert_eq!(a, b);
        // SAFETY: `b` is live.
        unsafe { tiermalloc_core::deallocate(b) };
    })
    .join()
    .unwrap();
}

#[test]
fn draining_free_breaks_lifo_reuse() {
    let heap = Heap::new();
    let mut cache = ThreadCache::new();
    let keep = heap.allocate_uncached(5).unwrap();
    let p1 = heap.allocate_with(&mut cache, 5).unwrap();
    let p2 = heap.allocate_with(&mut cache, 5).unwrap();
    let p3 = heap.allocate_with(&mut cache, 5).unwrap();
    assert_eq!(cache.quota(0), 3);
    assert_eq!(cache.class_len(0), 0);

    // SAFETY: each pointer came from this heap and is freed once.
    unsafe {
        heap.deallocate_with(&mut cache, p1).unwrap();
        heap.deallocate_with(&mut cache, p2).unwrap();
        assert_eq!(cache.class_len(0), 2);
        heap.deallocate_with(&mut cache, p3).unwrap();
    }
    // The third free reached the quota and sent all three back.
    assert_eq!(cache.class_len(0), 0);
    let next = heap.allocate_with(&mut cache, 5).unwrap();
    assert_ne!(next, p3);
    assert_eq!(next, p1);

    // Without a drain the most recent free comes straight back.
    // SAFETY: `next` is live.
    unsafe { heap.deallocate_with(&mut cache, next).unwrap() };
    let again = heap.allocate_with(&mut cache, 5).unwrap();
    assert_eq!(again, next);

    // SAFETY: both are live.
    unsafe {
        heap.deallocate_with(&mut cache, again).unwrap();
        heap.deallocate_uncached(keep).unwrap();
    }
    cache.release_all(&heap).unwrap();
    assert_eq!(heap.central().outstanding(0), 0);
}

#[test]
fn outstanding_counts_match_live_plus_cached() {
    let heap = Heap::new();
    let mut cache = ThreadCache::new();
    let mut rng = XorShift64::new(0x1234_5678_9abc_def1);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for _ in 0..4000 {
        if live.is_empty() || rng.gen_range(0, 9) < 6 {
            let size = rng.gen_range(1, MAX_SMALL_SIZE / 16);
            let ptr = heap.allocate_with(&mut cache, size).unwrap();
            live.push((ptr, size_class::index(size)));
        } else {
            let idx = rng.gen_range(0, live.len() - 1);
            let (ptr, _) = live.swap_remove(idx);
            // SAFETY: freed exactly once.
            unsafe { heap.deallocate_with(&mut cache, ptr).unwrap() };
        }
    }

    let mut live_per_class: HashMap<usize, usize> = HashMap::new();
    for &(_, index) in &live {
        *live_per_class.entry(index).or_default() += 1;
    }
    for index in 0..NUM_SIZE_CLASSES {
        let live_here = live_per_class.get(&index).copied().unwrap_or(0);
        assert_eq!(
            heap.central().outstanding(index),
            live_here + cache.class_len(index),
            "class {index}"
        );
    }

    for (ptr, _) in live {
        // SAFETY: freed exactly once.
        unsafe { heap.deallocate_with(&mut cache, ptr).unwrap() };
    }
    cache.release_all(&heap).unwrap();
    for index in 0..NUM_SIZE_CLASSES {
        assert_eq!(heap.central().outstanding(index), 0, "class {index}");
        assert_eq!(heap.central().span_count(index), 0, "class {index}");
    }
    assert_eq!(heap.pages().lock().free_pages() % MAX_PAGES, 0);
}

#[test]
fn uncached_outstanding_counts_match_live_exactly() {
    let heap = Heap::new();
    let mut rng = XorShift64::new(77);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_range(0, 2) > 0 {
            let size = rng.gen_range(1, 4096);
            live.push((heap.allocate_uncached(size).unwrap(), size_class::index(size)));
        } else {
            let idx = rng.gen_range(0, live.len() - 1);
            let (ptr, _) = live.swap_remove(idx);
            // SAFETY: freed exactly once.
            unsafe { heap.deallocate_uncached(ptr).unwrap() };
        }
        if rng.gen_range(0, 49) == 0 {
            let mut per_class = vec![0usize; NUM_SIZE_CLASSES];
            for &(_, index) in &live {
                per_class[index] += 1;
            }
            for (index, &count) in per_class.iter().enumerate() {
                assert_eq!(heap.central().outstanding(index), count);
            }
        }
    }
}

#[test]
fn freed_pages_coalesce_back_into_whole_chunks() {
    let heap = Heap::new();
    let mut cache = ThreadCache::new();
    let sizes = [MAX_SMALL_SIZE + 1, 100 * PAGE_SIZE, 300 * 1024];
    let ptrs: Vec<_> = sizes
        .iter()
        .map(|&s| heap.allocate_with(&mut cache, s).unwrap())
        .collect();
    for &ptr in &ptrs {
        let info = heap.span_info(ptr).unwrap();
        assert!(info.in_use);
        assert!(!info.oversize);
        assert_eq!(info.start.addr(), ptr.as_ptr() as usize);
    }
    for ptr in ptrs {
        // SAFETY: freed exactly once.
        unsafe { heap.deallocate_with(&mut cache, ptr).unwrap() };
    }
    // 65 + 100 + 75 pages need three chunks; every page of them is free again.
    let guard = heap.pages().lock();
    assert_eq!(guard.free_pages(), 3 * MAX_PAGES);
    assert_eq!(guard.live_spans(), (1..=MAX_PAGES).map(|n| guard.free_spans(n)).sum::<usize>());
}

#[test]
fn oversize_requests_bypass_the_buckets() {
    let heap = Heap::new();
    let mut cache = ThreadCache::new();
    let size = 4 * MAX_SMALL_SIZE;
    let ptr = heap.allocate_with(&mut cache, size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);

    let info = heap.span_info(ptr).unwrap();
    assert!(info.oversize);
    assert!(info.in_use);
    assert_eq!(info.pages, size / PAGE_SIZE);
    assert_eq!(info.block_size, size);
    assert_eq!(heap.pages().lock().free_pages(), 0);

    // SAFETY: the whole span is ours.
    unsafe { ptr.as_ptr().add(size - 1).write(0x42) };
    // SAFETY: freed exactly once.
    unsafe { heap.deallocate_with(&mut cache, ptr).unwrap() };
    assert_eq!(
        heap.span_info(ptr),
        Err(AllocError::ForeignPointer {
            addr: ptr.as_ptr() as usize
        })
    );
    assert_eq!(heap.pages().lock().free_pages(), 0);
}

#[test]
fn double_free_of_a_large_block_is_reported() {
    if !validation_level().checks_enabled() {
        return;
    }
    let heap = Heap::new();
    let mut cache = ThreadCache::new();
    let ptr = heap.allocate_with(&mut cache, 80 * PAGE_SIZE).unwrap();
    // SAFETY: first free is legitimate; the second must be rejected before
    // touching any state.
    unsafe {
        heap.deallocate_with(&mut cache, ptr).unwrap();
        assert_eq!(
            heap.deallocate_with(&mut cache, ptr),
            Err(AllocError::SpanNotInUse {
                addr: ptr.as_ptr() as usize
            })
        );
    }
}

#[test]
fn concurrent_churn_never_overlaps() {
    const THREADS: usize = 8;
    let ops = if cfg!(debug_assertions) { 3_000 } else { 20_000 };
    let heap = Arc::new(Heap::new());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                let mut cache = ThreadCache::new();
                let mut rng = XorShift64::new(0x9e37_79b9_7f4a_7c15 ^ (t as u64 + 1));
                let mut live: Vec<AllocationRec> = Vec::new();

                for op in 0..ops {
                    if live.is_empty() || rng.gen_range(0, 9) < 5 {
                        let size = rng.gen_size();
                        let ptr = heap.allocate_with(&mut cache, size).unwrap();
                        let rec = AllocationRec {
                            ptr,
                            requested_size: size,
                            tag: (t * 31 + op) as u8,
                        };
                        fill(&rec);
                        live.push(rec);
                    } else {
                        let idx = rng.gen_range(0, live.len() - 1);
                        let rec = live.swap_remove(idx);
                        check(&rec);
                        let info = heap.span_info(rec.ptr).unwrap();
                        assert_eq!(info.block_size, expected_block_size(rec.requested_size));
                        // SAFETY: freed exactly once.
                        unsafe { heap.deallocate_with(&mut cache, rec.ptr).unwrap() };
                    }
                }

                for rec in live {
                    check(&rec);
                    // SAFETY: freed exactly once.
                    unsafe { heap.deallocate_with(&mut cache, rec.ptr).unwrap() };
                }
                cache.release_all(&heap).unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    for index in 0..NUM_SIZE_CLASSES {
        assert_eq!(heap.central().outstanding(index), 0, "class {index}");
    }
}

#[test]
fn class_table_is_strictly_increasing() {
    let mut prev = 0;
    for index in 0..NUM_SIZE_CLASSES {
        let class = SizeClass::for_size(size_class::class_size(index));
        assert_eq!(class.index, index);
        assert!(class.size > prev);
        prev = class.size;
    }
    assert_eq!(prev, MAX_SMALL_SIZE);
}
