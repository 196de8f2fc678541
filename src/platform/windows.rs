//! Windows virtual memory backend using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_DECOMMIT: u32 = 0x4000;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_NOACCESS: u32 = 0x01;

// Windows allocation granularity is 64 KiB.
const ALLOC_GRANULARITY: usize = 65536;

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;
}

#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// VirtualAlloc reservations are only guaranteed aligned to the 64 KiB
/// allocation granularity; for larger `size` we over-reserve by `size` and
/// trim, the same strategy as the Unix backend.
pub unsafe fn reserve_aligned(size: usize, committed: bool) -> *mut u8 {
    let flags = if committed {
        MEM_COMMIT | MEM_RESERVE
    } else {
        MEM_RESERVE
    };
    let protect = if committed { PAGE_READWRITE } else { PAGE_NOACCESS };

    if size <= ALLOC_GRANULARITY {
        let ptr = unsafe { virtual_alloc(core::ptr::null_mut(), size, flags, protect) };
        return ptr as *mut u8;
    }

    let over = unsafe { virtual_alloc(core::ptr::null_mut(), size * 2, flags, protect) };
    if over.is_null() {
        return core::ptr::null_mut();
    }
    let over_addr = over as usize;
    let aligned_addr = round_up(over_addr, size);
    // VirtualFree cannot partially free a MEM_RESERVE region; release the
    // whole over-reservation and re-reserve exactly at the aligned address.
    unsafe { virtual_free(over, 0, MEM_RELEASE) };
    let ptr = unsafe { virtual_alloc(aligned_addr as *mut c_void, size, flags, protect) };
    ptr as *mut u8
}

pub unsafe fn reserve_at_least(size: usize, committed: bool) -> (*mut u8, usize) {
    let flags = if committed {
        MEM_COMMIT | MEM_RESERVE
    } else {
        MEM_RESERVE
    };
    let protect = if committed { PAGE_READWRITE } else { PAGE_NOACCESS };
    let alloc_size = round_up(size, ALLOC_GRANULARITY);
    let ptr = unsafe { virtual_alloc(core::ptr::null_mut(), alloc_size, flags, protect) };
    if ptr.is_null() {
        (core::ptr::null_mut(), 0)
    } else {
        (ptr as *mut u8, alloc_size)
    }
}

pub unsafe fn release(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire reservation).
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub unsafe fn notify_using(ptr: *mut u8, size: usize) {
    unsafe { virtual_alloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
}

pub unsafe fn notify_not_using(ptr: *mut u8, size: usize) {
    unsafe { virtual_free(ptr as *mut c_void, size, MEM_DECOMMIT) };
}
