#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]
#![cfg_attr(feature = "nightly", feature(allocator_api))]

//! coremalloc: a concurrent, size-class-based heap allocator.
//!
//! Architecture, leaves first:
//! - [`size_class`]: the size-class table and its reciprocal-division arithmetic.
//! - [`platform`]: the OS-facing capabilities (reserve/commit/decommit/timer).
//! - [`pagemap`]: flat address -> per-chunk metadata map.
//! - [`address_space`]: power-of-two reservation and splitting over raw OS memory.
//! - [`chunk_allocator`]: epoch-decayed cache of freed chunks, above the address space.
//! - [`slab`]: per-size-class slab/metaslab with randomised free lists.
//! - [`remote_queue`]: lock-free cross-thread free message queue.
//! - [`core_allocator`]: owns slabs for one "core", drains its remote queue.
//! - [`pool`]: lock-free pool of reusable core allocators.
//! - [`local_allocator`]: thread-local fast path, paired with a core allocator.
//! - [`allocator`]: ties the above into `GlobalAlloc`.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: coremalloc::CoreMalloc = coremalloc::CoreMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod address_space;
pub mod allocator;
pub mod chunk_allocator;
pub mod config;
pub mod core_allocator;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
#[cfg(feature = "alloc-histogram")]
pub mod histogram;
pub mod local_allocator;
#[macro_use]
pub mod macros;
pub mod pagemap;
pub mod platform;
pub mod pool;
pub mod remote_queue;
pub mod size_class;
pub mod slab;
pub mod stats;
pub mod sync;

/// Granularity of the pagemap and of every chunk the backend hands out.
/// All chunks are aligned to, and a multiple of, this many bytes.
pub use config::MIN_CHUNK_SIZE as CHUNK_SIZE;

// Re-export the allocator at crate root for convenience, matching the
// ergonomics of `std::alloc::System`.
pub use allocator::CoreMalloc;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e. the `fast` profile), not during tests.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
