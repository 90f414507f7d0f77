//! Errors surfaced by the pool

use std::alloc::Layout;

/// Failure to hand out storage
///
/// Only requests the allocator can actually reject show up here.
/// Freeing a foreign pointer or freeing twice is *not* detected,
/// see the `# Safety` sections on the deallocation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// A zero-byte request, which never gets storage
    #[error("cannot allocate {size} bytes")]
    InvalidSize { size: usize },
    /// The system allocator could not supply memory
    /// (either a new block for a pool or an oversized request)
    #[error("system allocator could not satisfy {layout:?}")]
    ResourceExhaustion { layout: Layout },
    /// The pool configuration cannot produce working size classes
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),
}
