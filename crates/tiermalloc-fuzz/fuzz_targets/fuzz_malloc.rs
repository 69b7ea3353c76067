#![no_main]
use std::ptr::NonNull;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation on the process heap.
    if data.len() < 4 {
        return;
    }

    let mut allocations: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize * (1 + chunk[3] as usize % 8);

        match op {
            0 => {
                let ptr = tiermalloc_core::allocate(size);
                let tag = chunk[3];
                // SAFETY: the block holds at least `size` bytes.
                unsafe { ptr.as_ptr().write_bytes(tag, size) };
                allocations.push((ptr, size, tag));
            }
            1 => {
                if let Some((ptr, size, tag)) = allocations.pop() {
                    // SAFETY: the block is live and was filled with `tag`.
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == tag), "block contents were clobbered");
                    // SAFETY: freed exactly once.
                    unsafe { tiermalloc_core::deallocate(ptr) };
                }
            }
            2 => {
                if !allocations.is_empty() {
                    let idx = chunk[1] as usize % allocations.len();
                    let (ptr, size, _) = allocations.swap_remove(idx);
                    assert!(tiermalloc_core::usable_size(ptr) >= size.max(1));
                    // SAFETY: freed exactly once.
                    unsafe { tiermalloc_core::deallocate(ptr) };
                }
            }
            _ => {
                if let Some(&(ptr, _, _)) = allocations.last() {
                    assert!(tiermalloc_core::global().validate(ptr).is_ok());
                }
            }
        }
    }

    for (ptr, _, _) in allocations {
        // SAFETY: freed exactly once.
        unsafe { tiermalloc_core::deallocate(ptr) };
    }
});
