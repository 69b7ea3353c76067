//! Allocator constants and runtime validation mode.
//!
//! Geometry (page size, small-allocation ceiling, largest cached span) is
//! fixed at compile time. The only runtime knob is the deallocation
//! validation level, set via the `TIERMALLOC_MODE` environment variable:
//! - `strict` (default): every `deallocate` checks that the pointer is owned,
//!   starts a block, and belongs to an in-use span before touching any list.
//! - `off`: no checks. Pointers are trusted; useful for benchmarking only.

use std::sync::atomic::{AtomicU8, Ordering};

/// log2 of the page size the allocator manages.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request served by the thread/central tiers (256 KiB).
pub const MAX_SMALL_SIZE: usize = 256 * 1024;

/// Number of size classes (and therefore free lists per thread cache).
pub const NUM_SIZE_CLASSES: usize = 208;

/// Largest span the page cache buckets. Bigger runs are mapped directly.
pub const MAX_PAGES: usize = 128;

/// Bytes the object pool claims from the OS at a time.
pub const OBJECT_POOL_CHUNK: usize = 128 * 1024;

/// Virtual address space reserved up front for the heap-extension region.
/// Needs a 64-bit `usize`, like the 36-bit page numbers of the page map.
pub const HEAP_RESERVE_BYTES: usize = 16 << 30;

/// Environment variable selecting the [`ValidationLevel`].
pub const MODE_ENV: &str = "TIERMALLOC_MODE";

/// How much checking `deallocate` performs before trusting a pointer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationLevel {
    /// Reject foreign, misaligned and double-freed pointers (fatal).
    #[default]
    Strict,
    /// Trust the caller.
    Off,
}

impl ValidationLevel {
    /// Parse from string (case-insensitive). Unknown values are strict.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" | "fast" | "trust" => Self::Off,
            _ => Self::Strict,
        }
    }

    /// Returns true if deallocation checks are active.
    #[must_use]
    pub const fn checks_enabled(self) -> bool {
        matches!(self, Self::Strict)
    }
}

// 0=unresolved, 1=Strict, 2=Off, 255=resolving.
// Reading the environment allocates; when this crate is the process allocator
// that allocation re-enters here, so resolution must not block or recurse.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_STRICT: u8 = 1;
const LEVEL_OFF: u8 = 2;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: ValidationLevel) -> u8 {
    match level {
        ValidationLevel::Strict => LEVEL_STRICT,
        ValidationLevel::Off => LEVEL_OFF,
    }
}

fn u8_to_level(v: u8) -> ValidationLevel {
    match v {
        LEVEL_OFF => ValidationLevel::Off,
        _ => ValidationLevel::Strict,
    }
}

/// Get the configured validation level (reads the env var on first call).
///
/// A reentrant call that arrives while the variable is being read observes
/// the RESOLVING state and gets `Strict`.
#[must_use]
pub fn validation_level() -> ValidationLevel {
    let cached = CACHED_LEVEL.load(Ordering::Relaxed);

    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }

    if cached == LEVEL_RESOLVING {
        return ValidationLevel::Strict;
    }

    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            ValidationLevel::Strict
        };
    }

    let level = std::env::var(MODE_ENV)
        .map(|v| ValidationLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}
