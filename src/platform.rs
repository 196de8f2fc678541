//! Platform abstraction layer (PAL): the only place that talks to the OS.
//!
//! Everything above this module works in terms of these capabilities and
//! never calls `mmap`/`VirtualAlloc` directly. Three backends are provided:
//! Unix (`mmap`/`munmap`/`madvise`), Windows (`VirtualAlloc`/`VirtualFree`),
//! and a Miri-compatible shim built on `alloc::alloc` for when real syscalls
//! aren't available under the interpreter.

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

#[cfg(miri)]
mod miri;

use crate::config::MIN_CHUNK_SIZE;

/// Reserve `size` bytes of address space aligned to `size` itself (`size`
/// must be a power of two `>= MIN_CHUNK_SIZE`). If `committed` is true the
/// memory is immediately backed and zeroed; otherwise only the address
/// range is reserved and must be passed to [`notify_using`] before use.
///
/// Returns null on failure.
///
/// # Safety
/// Caller must eventually call [`release`] with the same `ptr`/`size`.
#[inline]
pub unsafe fn reserve_aligned(size: usize, committed: bool) -> *mut u8 {
    debug_assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);
    #[cfg(miri)]
    {
        unsafe { miri::reserve_aligned(size, committed) }
    }
    #[cfg(all(not(miri), windows))]
    {
        unsafe { windows::reserve_aligned(size, committed) }
    }
    #[cfg(all(not(miri), unix))]
    {
        unsafe { unix::reserve_aligned(size, committed) }
    }
}

/// Reserve at least `size` bytes without an alignment guarantee beyond the
/// platform's natural allocation granularity. Used by the address-space
/// manager when it needs a large region and is prepared to trim the ends
/// itself.
///
/// Returns `(ptr, actual_size)`; `actual_size >= size`.
///
/// # Safety
/// Caller must eventually call [`release`] with the returned `ptr`/`actual_size`.
#[inline]
pub unsafe fn reserve_at_least(size: usize, committed: bool) -> (*mut u8, usize) {
    #[cfg(miri)]
    {
        unsafe { miri::reserve_at_least(size, committed) }
    }
    #[cfg(all(not(miri), windows))]
    {
        unsafe { windows::reserve_at_least(size, committed) }
    }
    #[cfg(all(not(miri), unix))]
    {
        unsafe { unix::reserve_at_least(size, committed) }
    }
}

/// Release address space previously obtained from [`reserve_aligned`] or
/// [`reserve_at_least`]. This allocator never returns reserved address
/// space to the OS during normal operation (§ Non-goals); provided for
/// completeness and tests.
///
/// # Safety
/// `ptr`/`size` must exactly match a prior reservation.
#[inline]
pub unsafe fn release(ptr: *mut u8, size: usize) {
    #[cfg(miri)]
    {
        unsafe { miri::release(ptr, size) }
    }
    #[cfg(all(not(miri), windows))]
    {
        unsafe { windows::release(ptr, size) }
    }
    #[cfg(all(not(miri), unix))]
    {
        unsafe { unix::release(ptr, size) }
    }
}

/// Ensure `[ptr, ptr+size)` is backed by physical memory and readable as
/// zero. Idempotent on already-committed memory.
///
/// # Safety
/// `[ptr, ptr+size)` must be within a live reservation.
#[inline]
pub unsafe fn notify_using(ptr: *mut u8, size: usize) {
    #[cfg(miri)]
    {
        unsafe { miri::notify_using(ptr, size) }
    }
    #[cfg(all(not(miri), windows))]
    {
        unsafe { windows::notify_using(ptr, size) }
    }
    #[cfg(all(not(miri), unix))]
    {
        unsafe { unix::notify_using(ptr, size) }
    }
}

/// Tell the OS the pages in `[ptr, ptr+size)` are no longer needed. The
/// address range remains reserved; a later [`notify_using`] call re-commits
/// and re-zeroes it.
///
/// # Safety
/// `[ptr, ptr+size)` must be within a live reservation.
#[inline]
pub unsafe fn notify_not_using(ptr: *mut u8, size: usize) {
    #[cfg(miri)]
    {
        unsafe { miri::notify_not_using(ptr, size) }
    }
    #[cfg(all(not(miri), windows))]
    {
        unsafe { windows::notify_not_using(ptr, size) }
    }
    #[cfg(all(not(miri), unix))]
    {
        unsafe { unix::notify_not_using(ptr, size) }
    }
}

/// Explicitly zero `[ptr, ptr+size)`. Most platforms already return
/// zeroed pages from `notify_using`; this exists for callers that cannot
/// rely on that guarantee (e.g. reusing a Metaslab header slot).
///
/// # Safety
/// `[ptr, ptr+size)` must be writable.
#[inline]
pub unsafe fn zero(ptr: *mut u8, size: usize) {
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
}

/// Fatal allocator error: corruption, double free, or an internal invariant
/// violation. Aborts the process; never returns.
#[cold]
pub fn error(msg: &str) -> ! {
    #[cfg(feature = "std")]
    {
        std::eprintln!("coremalloc: fatal: {msg}");
    }
    #[cfg(not(feature = "std"))]
    {
        let _ = msg;
    }
    #[cfg(unix)]
    unsafe {
        unsafe extern "C" {
            fn abort() -> !;
        }
        abort()
    }
    #[cfg(not(unix))]
    {
        loop {
            core::hint::spin_loop();
        }
    }
}

/// Spin-wait hint for CAS retry loops.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Best-effort periodic timer used to drive the chunk allocator's epoch
/// decay. Not every embedding has a timer facility; callers must tolerate
/// `register_timer` never firing and fall back to decaying on demand
/// (e.g. from `cleanup_unused`).
///
/// With the `std` feature this spawns a detached background thread that
/// sleeps for `period_ms` and invokes `callback` in a loop, for the
/// lifetime of the process. Without `std` this is a no-op and returns
/// `false`.
pub fn register_timer(period_ms: u64, callback: fn()) -> bool {
    #[cfg(feature = "std")]
    {
        std::thread::Builder::new()
            .name(std::string::String::from("coremalloc-decay"))
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_millis(period_ms));
                callback();
            })
            .is_ok()
    }
    #[cfg(not(feature = "std"))]
    {
        let _ = (period_ms, callback);
        false
    }
}
