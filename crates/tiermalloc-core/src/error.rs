//! Allocator failure taxonomy.
//!
//! Every internal step returns `Result<_, AllocError>`. The process-wide
//! entry points have no recoverable channel: they hand any error to
//! [`fatal`], which logs it and aborts.

use thiserror::Error;

/// Which OS primitive a failed acquisition went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Contiguous growth of the reserved heap region.
    HeapExtension,
    /// A standalone anonymous mapping.
    AnonymousMap,
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeapExtension => f.write_str("heap extension"),
            Self::AnonymousMap => f.write_str("anonymous mmap"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory: {primitive} refused {pages} pages")]
    OutOfMemory { pages: usize, primitive: Primitive },
    #[error("pointer {addr:#x} is not owned by this allocator")]
    ForeignPointer { addr: usize },
    #[error("pointer {addr:#x} is not the start of a {block_size}-byte block")]
    MisalignedBlock { addr: usize, block_size: usize },
    #[error("pointer {addr:#x} belongs to a span that is not in use")]
    SpanNotInUse { addr: usize },
    #[error("address {addr:#x} is outside the page map's range")]
    AddressOutOfRange { addr: usize },
    #[error("request of {size} bytes exceeds the addressable range")]
    SizeOverflow { size: usize },
}

/// Abort the process on an unrecoverable allocator failure.
#[cold]
pub fn fatal(err: AllocError) -> ! {
    log::error!("tiermalloc fatal: {err}");
    std::process::abort()
}
