//! C-ABI exports: `malloc`/`free`/`calloc`/`realloc` and friends, for
//! linking this allocator into a C (or C-calling) binary in place of the
//! platform libc's.
//!
//! Gated behind `features = ["ffi"]` (`c-abi` implies it). Built as part
//! of the staticlib when `crate-type` includes `staticlib`.

use crate::allocator::{self, MALLOC_ALIGN};
use core::ffi::{c_int, c_void};
use core::ptr;

mod errno {
    use core::ffi::c_int;

    unsafe extern "C" {
        #[cfg(target_os = "macos")]
        fn __error() -> *mut c_int;

        #[cfg(target_os = "linux")]
        fn __errno_location() -> *mut c_int;
    }

    #[inline]
    pub fn set(val: c_int) {
        #[cfg(any(target_os = "macos", target_os = "linux"))]
        unsafe {
            #[cfg(target_os = "macos")]
            {
                *__error() = val;
            }
            #[cfg(target_os = "linux")]
            {
                *__errno_location() = val;
            }
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = val;
        }
    }

    pub const ENOMEM: c_int = 12;
    pub const EINVAL: c_int = 22;
    #[cfg(target_os = "macos")]
    pub const EOVERFLOW: c_int = 84;
    #[cfg(not(target_os = "macos"))]
    pub const EOVERFLOW: c_int = 75;
}

#[inline]
fn fail_null(e: c_int) -> *mut c_void {
    errno::set(e);
    ptr::null_mut()
}

/// Allocate `size` bytes with the platform's default malloc alignment.
/// Returns null with `errno = ENOMEM` on failure. `malloc(0)` returns null
/// without setting `errno` (a valid, if unhelpful, implementation choice
/// for glibc-compatible callers that only ever pass the result to `free`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if size == 0 {
        return ptr::null_mut();
    }
    let ptr = unsafe { allocator::alloc_inner(size, MALLOC_ALIGN) };
    if ptr.is_null() {
        return fail_null(errno::ENOMEM);
    }
    ptr.cast::<c_void>()
}

/// Free a pointer previously returned by `malloc`/`calloc`/`realloc`/
/// `aligned_alloc`/`posix_memalign`/`reallocarray`. A null pointer is a
/// no-op.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { allocator::dealloc_inner(ptr.cast::<u8>()) };
}

/// Allocate and zero `nmemb * size` bytes. Returns null with
/// `errno = EOVERFLOW` if the multiplication overflows, or
/// `errno = ENOMEM` on allocation failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return fail_null(errno::EOVERFLOW),
    };
    if total == 0 {
        return ptr::null_mut();
    }
    let raw = unsafe { allocator::alloc_inner(total, MALLOC_ALIGN) };
    if raw.is_null() {
        return fail_null(errno::ENOMEM);
    }
    unsafe { ptr::write_bytes(raw, 0, total) };
    raw.cast::<c_void>()
}

/// Resize a prior allocation. In-place (same pointer) if `new_size` still
/// fits the object's current size class or large-object chunk; otherwise
/// allocate, copy the overlapping prefix, and free the original.
/// `realloc(NULL, n)` behaves like `malloc(n)`; `realloc(p, 0)` behaves
/// like `free(p)` and returns null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    if new_size == 0 {
        // Unlike `GlobalAlloc::dealloc`, this entry point has no caller-
        // tracked layout to special-case a zero-size "dangling" pointer:
        // handing one back here would let a C caller `free()` a pointer
        // this allocator never actually backed. Free for real and
        // return null, the common realloc(p, 0) convention.
        unsafe { allocator::dealloc_inner(ptr.cast::<u8>()) };
        return ptr::null_mut();
    }
    let result = unsafe { allocator::realloc_inner(ptr.cast::<u8>(), MALLOC_ALIGN, new_size) };
    if result.is_null() {
        return fail_null(errno::ENOMEM);
    }
    result.cast::<c_void>()
}

/// `realloc(ptr, nmemb * size)` with the same overflow-checked
/// multiplication as [`calloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn reallocarray(
    ptr: *mut c_void,
    nmemb: usize,
    size: usize,
) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return fail_null(errno::EOVERFLOW),
    };
    unsafe { realloc(ptr, total) }
}

/// Allocate `size` bytes aligned to `align`. `align` must be a power of
/// two and `size` must be a multiple of `align` (the C11 `aligned_alloc`
/// contract); violating either sets `errno = EINVAL` and returns null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    if !align.is_power_of_two() || !size.is_multiple_of(align) {
        return fail_null(errno::EINVAL);
    }
    if size == 0 {
        return ptr::null_mut();
    }
    let raw = unsafe { allocator::alloc_inner(size, align) };
    if raw.is_null() {
        return fail_null(errno::ENOMEM);
    }
    raw.cast::<c_void>()
}

/// POSIX `posix_memalign`: on success, writes the new pointer through
/// `memptr` and returns `0`. On failure, `*memptr` is left unchanged and
/// the POSIX error code (not an `errno` value) is returned directly:
/// `EINVAL` if `align` isn't a power of two that's also a multiple of
/// `size_of::<*const ()>()`, `ENOMEM` on allocation failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    if !align.is_power_of_two() || !align.is_multiple_of(core::mem::size_of::<*const ()>()) {
        return errno::EINVAL;
    }
    if size == 0 {
        unsafe { *memptr = ptr::null_mut() };
        return 0;
    }
    let raw = unsafe { allocator::alloc_inner(size, align) };
    if raw.is_null() {
        return errno::ENOMEM;
    }
    unsafe { *memptr = raw.cast::<c_void>() };
    0
}

/// Usable size of a live allocation — may be larger than what was
/// originally requested (the size class's `rsize`, or the whole rounded
/// chunk for a large allocation). Returns `0` for a null pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    allocator::usable_size(ptr.cast::<u8>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_round_trips() {
        unsafe {
            let p = malloc(64);
            assert!(!p.is_null());
            free(p);
        }
    }

    #[test]
    fn malloc_zero_returns_null() {
        unsafe {
            assert!(malloc(0).is_null());
        }
    }

    #[test]
    fn calloc_zeroes_memory() {
        unsafe {
            let p = calloc(16, 8).cast::<u8>();
            assert!(!p.is_null());
            for i in 0..128 {
                assert_eq!(*p.add(i), 0);
            }
            free(p.cast::<c_void>());
        }
    }

    #[test]
    fn calloc_overflow_sets_eoverflow() {
        unsafe {
            let p = calloc(usize::MAX, 2);
            assert!(p.is_null());
        }
    }

    #[test]
    fn realloc_grows_and_preserves_contents() {
        unsafe {
            let p = malloc(8).cast::<u8>();
            *p = 0x7A;
            let grown = realloc(p.cast::<c_void>(), 4096).cast::<u8>();
            assert!(!grown.is_null());
            assert_eq!(*grown, 0x7A);
            free(grown.cast::<c_void>());
        }
    }

    #[test]
    fn aligned_alloc_rejects_non_power_of_two() {
        unsafe {
            assert!(aligned_alloc(3, 64).is_null());
        }
    }

    #[test]
    fn aligned_alloc_honours_alignment() {
        unsafe {
            let p = aligned_alloc(256, 256);
            assert!(!p.is_null());
            assert_eq!(p as usize % 256, 0);
            free(p);
        }
    }

    #[test]
    fn posix_memalign_rejects_bad_alignment() {
        unsafe {
            let mut out: *mut c_void = ptr::null_mut();
            let rc = posix_memalign(&mut out, 3, 64);
            assert_eq!(rc, errno::EINVAL);
            assert!(out.is_null());
        }
    }

    #[test]
    fn posix_memalign_succeeds() {
        unsafe {
            let mut out: *mut c_void = ptr::null_mut();
            let rc = posix_memalign(&mut out, 64, 128);
            assert_eq!(rc, 0);
            assert!(!out.is_null());
            assert_eq!(out as usize % 64, 0);
            free(out);
        }
    }

    #[test]
    fn malloc_usable_size_is_at_least_requested() {
        unsafe {
            let p = malloc(40);
            assert!(malloc_usable_size(p) >= 40);
            free(p);
        }
    }
}
