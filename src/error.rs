//! Allocator error taxonomy.
//!
//! A failure below the `GlobalAlloc` boundary is one of three kinds.
//! Resource exhaustion ([`AllocError::OutOfMemory`]) is the only
//! recoverable one: it surfaces as an ordinary null pointer, exactly the
//! way [`core::alloc::GlobalAlloc::alloc`] already signals failure, and
//! the `ffi` shim translates that into `errno = ENOMEM`. A caller
//! contract violation or internal corruption indicates a bug rather than
//! a resource limit; both are fatal, via [`crate::platform::error`],
//! since there is no well-defined allocator state to hand back to the
//! caller once either has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The platform backend could not satisfy a reservation or commit
    /// request for a data chunk. Recoverable: the allocation that
    /// triggered it returns a null pointer.
    OutOfMemory,
    /// A caller-supplied argument violated this allocator's contract
    /// (for example, a non-power-of-two alignment reaching an internal
    /// routine that assumes one). Fatal.
    BadArgument,
    /// Internal bookkeeping was found in a state that should be
    /// impossible absent memory corruption or a use-after-free. Fatal.
    Corruption,
}
