//! Unix virtual memory backend using mmap/munmap/madvise.

use core::ffi::c_void;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const PROT_NONE: i32 = 0x0;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
}

unsafe fn raw_mmap(size: usize, prot: i32) -> *mut c_void {
    unsafe { mmap(core::ptr::null_mut(), size, prot, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0) }
}

/// `size` must already be a power of two. mmap only guarantees alignment to
/// the system page size (4 KiB), so for alignments above that we
/// over-allocate by `size` and trim the unaligned head/tail.
pub unsafe fn reserve_aligned(size: usize, committed: bool) -> *mut u8 {
    let prot = if committed { PROT_READ | PROT_WRITE } else { PROT_NONE };
    // Try the fast path first: many allocators land page-aligned mmaps on an
    // address that already satisfies a modest power-of-two alignment.
    let raw = unsafe { raw_mmap(size, prot) };
    if raw == MAP_FAILED {
        return core::ptr::null_mut();
    }
    let raw_addr = raw as usize;
    if raw_addr % size == 0 {
        return raw_addr as *mut u8;
    }
    unsafe { munmap(raw, size) };

    // Slow path: over-reserve by `size` extra bytes, trim both ends.
    let over = unsafe { raw_mmap(size * 2, prot) };
    if over == MAP_FAILED {
        return core::ptr::null_mut();
    }
    let over_addr = over as usize;
    let aligned_addr = (over_addr + size - 1) & !(size - 1);
    let lead = aligned_addr - over_addr;
    if lead > 0 {
        unsafe { munmap(over_addr as *mut c_void, lead) };
    }
    let trail = (over_addr + size * 2) - (aligned_addr + size);
    if trail > 0 {
        unsafe { munmap((aligned_addr + size) as *mut c_void, trail) };
    }
    aligned_addr as *mut u8
}

pub unsafe fn reserve_at_least(size: usize, committed: bool) -> (*mut u8, usize) {
    let prot = if committed { PROT_READ | PROT_WRITE } else { PROT_NONE };
    let raw = unsafe { raw_mmap(size, prot) };
    if raw == MAP_FAILED {
        (core::ptr::null_mut(), 0)
    } else {
        (raw as *mut u8, size)
    }
}

pub unsafe fn release(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub unsafe fn notify_using(ptr: *mut u8, size: usize) {
    unsafe { mprotect(ptr as *mut c_void, size, PROT_READ | PROT_WRITE) };
}

pub unsafe fn notify_not_using(ptr: *mut u8, size: usize) {
    unsafe { madvise(ptr as *mut c_void, size, MADV_DONTNEED) };
}
