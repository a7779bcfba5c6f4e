use thiserror::Error;

/// Failure to obtain memory. The only way [`crate::Arena::allocate`] can fail
/// is the operating system refusing to move the heap boundary, so this enum
/// has a single variant. The heap is left exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("the heap could not be extended")]
    OutOfMemory,
}

/// Failure to release a pointer. Covers pointers that were never produced by
/// the allocator, pointers into the middle of a payload, double releases and
/// pointers whose block was coalesced into its predecessor (at which point the
/// block's identity no longer exists, so these cases are indistinguishable
/// from one another and reported identically).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("pointer does not match any live allocation")]
    InvalidPointer,
}
