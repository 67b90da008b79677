use thiserror::Error;

/// No free block or subtree can satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of heap memory")]
pub struct AllocError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("heap capacity {0:#x} is not a power of two")]
    NotPowerOfTwo(usize),
    #[error("heap capacity {capacity:#x} is too small, at least {required:#x} bytes are needed")]
    TooSmall { capacity: usize, required: usize },
    #[error("heap base {0:#x} is not 8-byte aligned")]
    Misaligned(usize),
    #[error("heap is already initialized")]
    AlreadyInitialized,
}

/// A pointer passed to `release` that the allocator refuses to take back.
/// Addresses are absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("{0:#x} is outside the heap")]
    OutOfBounds(usize),
    #[error("{0:#x} is not a live allocation")]
    NotAllocated(usize),
    #[error("{0:#x} was already released")]
    DoubleFree(usize),
    #[error("heap is not initialized")]
    Uninitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown allocation strategy {0:?}, expected one of: thin, fat, tree")]
pub struct ParseStrategyError(pub(crate) alloc::string::String);

/// Logs a refused release on its way back to the caller.
pub(crate) fn rejected(err: ReleaseError) -> ReleaseError {
    log::warn!("Rejected release: {}", err);
    err
}
