//! Size classes for small allocations.
//!
//! Requests up to [`MAX_SMALL_SIZE`] are rounded up to one of 208 classes,
//! each backed by its own free list. Alignment coarsens as sizes grow, which
//! keeps internal fragmentation near 12% while the class count stays small:
//!
//! | sizes                | alignment | free lists |
//! |----------------------|-----------|------------|
//! | 1 ..= 128            | 8 B       | 0 .. 16    |
//! | 129 ..= 1024         | 16 B      | 16 .. 72   |
//! | 1025 ..= 8 KiB       | 128 B     | 72 .. 128  |
//! | 8 KiB+1 ..= 64 KiB   | 1 KiB     | 128 .. 184 |
//! | 64 KiB+1 ..= 256 KiB | 8 KiB     | 184 .. 208 |
//!
//! Requests above the ceiling bypass the classes and are rounded to pages.

use crate::config::{MAX_SMALL_SIZE, NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;

/// Fewest blocks a refill or drain batch may move.
pub const MIN_BATCH: usize = 2;

/// Most blocks a refill or drain batch may move.
pub const MAX_BATCH: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Band {
    /// Largest size in the previous band.
    base: usize,
    /// Largest size in this band.
    limit: usize,
    /// log2 of the band's alignment.
    shift: usize,
    /// Free-list index of the band's first class.
    first_index: usize,
}

const BANDS: [Band; 5] = [
    Band { base: 0, limit: 128, shift: 3, first_index: 0 },
    Band { base: 128, limit: 1024, shift: 4, first_index: 16 },
    Band { base: 1024, limit: 8 * 1024, shift: 7, first_index: 72 },
    Band { base: 8 * 1024, limit: 64 * 1024, shift: 10, first_index: 128 },
    Band { base: 64 * 1024, limit: 256 * 1024, shift: 13, first_index: 184 },
];

const fn band_for(size: usize) -> Band {
    let mut i = 0;
    while i < BANDS.len() - 1 {
        if size <= BANDS[i].limit {
            return BANDS[i];
        }
        i += 1;
    }
    BANDS[BANDS.len() - 1]
}

/// Rounds a small request up to its class size.
///
/// `size` must be in `1..=MAX_SMALL_SIZE`.
#[must_use]
pub const fn round_up(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= MAX_SMALL_SIZE);
    let align = 1 << band_for(size).shift;
    (size + align - 1) & !(align - 1)
}

/// Computes the free-list index for a small request.
///
/// `size` must be in `1..=MAX_SMALL_SIZE`.
#[must_use]
pub const fn index(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= MAX_SMALL_SIZE);
    let band = band_for(size);
    let align = 1 << band.shift;
    band.first_index + ((size - band.base + align - 1) >> band.shift) - 1
}

/// Returns the block size served by free list `index`.
///
/// Returns 0 for out-of-range indices.
#[must_use]
pub const fn class_size(index: usize) -> usize {
    if index >= NUM_SIZE_CLASSES {
        return 0;
    }
    let mut b = BANDS.len() - 1;
    while BANDS[b].first_index > index {
        b -= 1;
    }
    let band = BANDS[b];
    band.base + ((index - band.first_index + 1) << band.shift)
}

/// Most blocks of `size` bytes one batch may move between thread and
/// central cache, clamped to `[MIN_BATCH, MAX_BATCH]`.
#[must_use]
pub const fn batch_limit(size: usize) -> usize {
    debug_assert!(size > 0);
    let n = MAX_SMALL_SIZE / size;
    if n < MIN_BATCH {
        MIN_BATCH
    } else if n > MAX_BATCH {
        MAX_BATCH
    } else {
        n
    }
}

/// Page count of the span the central cache requests for `size`-byte blocks.
#[must_use]
pub const fn span_pages(size: usize) -> usize {
    let pages = (batch_limit(size) * size) >> PAGE_SHIFT;
    if pages == 0 { 1 } else { pages }
}

/// Page count needed for a request above the small-allocation ceiling.
pub fn large_pages(size: usize) -> Result<usize, AllocError> {
    size.checked_add(PAGE_SIZE - 1)
        .map(|padded| padded >> PAGE_SHIFT)
        .ok_or(AllocError::SizeOverflow { size })
}

/// Describes a single size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Rounded block size (bytes).
    pub size: usize,
    /// Free-list index.
    pub index: usize,
    /// Largest refill/drain batch.
    pub batch_limit: usize,
    /// Pages per span carved for this class.
    pub span_pages: usize,
}

impl SizeClass {
    /// Classifies a small request.
    #[must_use]
    pub const fn for_size(size: usize) -> Self {
        let rounded = round_up(size);
        Self {
            size: rounded,
            index: index(size),
            batch_limit: batch_limit(rounded),
            span_pages: span_pages(rounded),
        }
    }

    /// Blocks carved from one span of this class.
    #[must_use]
    pub const fn blocks_per_span(&self) -> usize {
        (self.span_pages << PAGE_SHIFT) / self.size
    }
}

/// Builds the full class table, one entry per free list.
#[must_use]
pub fn init_size_classes() -> Vec<SizeClass> {
    (0..NUM_SIZE_CLASSES)
        .map(|i| SizeClass::for_size(class_size(i)))
        .collect()
}
