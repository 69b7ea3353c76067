#![no_main]
use std::ptr::NonNull;

use libfuzzer_sys::fuzz_target;
use tiermalloc_core::{Heap, ThreadCache};

static HEAP: Heap = Heap::new();

fuzz_target!(|data: &[u8]| {
    // Mixes cached and uncached calls on one heap and checks that live
    // blocks never overlap.
    let mut cache = ThreadCache::new();
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in data.chunks_exact(3) {
        let size = 1 + u16::from_le_bytes([chunk[1], chunk[2]]) as usize * 5;
        match chunk[0] % 4 {
            0 | 1 => {
                let ptr = if chunk[0] % 4 == 0 {
                    HEAP.allocate_with(&mut cache, size)
                } else {
                    HEAP.allocate_uncached(size)
                }
                .expect("allocation failed");
                let start = ptr.as_ptr() as usize;
                for &(s, len) in &live {
                    assert!(start + size <= s || s + len <= start, "live blocks overlap");
                }
                live.push((start, size));
            }
            2 => {
                if let Some((start, _)) = live.pop() {
                    let ptr = NonNull::new(start as *mut u8).expect("null block");
                    // SAFETY: freed exactly once.
                    unsafe { HEAP.deallocate_with(&mut cache, ptr) }.expect("free failed");
                }
            }
            _ => {
                if let Some((start, _)) = live.pop() {
                    let ptr = NonNull::new(start as *mut u8).expect("null block");
                    // SAFETY: freed exactly once.
                    unsafe { HEAP.deallocate_uncached(ptr) }.expect("free failed");
                }
            }
        }
    }

    for (start, _) in live {
        let ptr = NonNull::new(start as *mut u8).expect("null block");
        // SAFETY: freed exactly once.
        unsafe { HEAP.deallocate_with(&mut cache, ptr) }.expect("free failed");
    }
    cache.release_all(&HEAP).expect("drain failed");
});
