//! Miri-compatible platform shim using `alloc::alloc` as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/VirtualAlloc), so we use the
//! system allocator to provide aligned memory. This lets Miri check all the
//! unsafe pointer logic in the allocator internals.

extern crate alloc;

use core::alloc::Layout;

fn layout_for(size: usize) -> Layout {
    Layout::from_size_align(size, size.next_power_of_two().max(crate::config::MIN_CHUNK_SIZE))
        .expect("invalid layout requested from miri platform shim")
}

pub unsafe fn reserve_aligned(size: usize, _committed: bool) -> *mut u8 {
    let layout = Layout::from_size_align(size, size).expect("size must be power of two");
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

pub unsafe fn reserve_at_least(size: usize, _committed: bool) -> (*mut u8, usize) {
    let layout = layout_for(size);
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    (ptr, layout.size())
}

pub unsafe fn release(ptr: *mut u8, size: usize) {
    let layout = Layout::from_size_align(size, size.next_power_of_two().max(1))
        .unwrap_or_else(|_| layout_for(size));
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

pub unsafe fn notify_using(ptr: *mut u8, size: usize) {
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
}

pub unsafe fn notify_not_using(_ptr: *mut u8, _size: usize) {}
