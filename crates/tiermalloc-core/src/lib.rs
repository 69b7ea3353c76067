//! # tiermalloc-core
//!
//! A three-tier memory allocator: a lock-free per-thread cache of
//! size-classed free lists, a central cache of spans with one lock per size
//! class, and a page cache that splits and coalesces page runs on top of the
//! OS.
//!
//! Small requests (up to 256 KiB) are served from the calling thread's cache
//! and refilled in adaptive batches. Larger requests go straight to the page
//! cache. `deallocate` takes no size: the owning span is recovered from a
//! radix-tree page map.
//!
//! ```no_run
//! let ptr = tiermalloc_core::allocate(100);
//! assert!(tiermalloc_core::usable_size(ptr) >= 100);
//! unsafe { tiermalloc_core::deallocate(ptr) };
//! ```
//!
//! The runtime validation mode is read from `TIERMALLOC_MODE` (see
//! [`config`]). Only 64-bit targets are supported.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("tiermalloc-core supports 64-bit targets only");

pub mod allocator;
pub mod central_cache;
pub mod config;
pub mod error;
pub mod free_list;
pub mod global;
pub mod object_pool;
pub mod os;
pub mod page_cache;
mod page_map;
pub mod size_class;
pub mod span;
pub mod thread_cache;

pub use allocator::{Heap, allocate, deallocate, global, thread_cached_blocks, usable_size};
pub use config::{ValidationLevel, validation_level};
pub use error::AllocError;
pub use global::TierMalloc;
pub use span::{PageId, SpanInfo};
pub use thread_cache::ThreadCache;
