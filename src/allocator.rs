//! Top-level allocator: ties every tier together and implements `GlobalAlloc`.
//!
//! `CoreMalloc` is zero-sized; all mutable state lives in the per-thread
//! [`LocalAllocator`] (TLS, plumbing below) and the process-wide statics in
//! [`crate::pool`], [`crate::chunk_allocator`] and [`crate::address_space`].
//!
//! TLS strategy (fastest to slowest, selected by feature):
//! - `nightly`: `#[thread_local]` with const-init (single TLS read, no branches)
//! - `std`: `std::thread_local!` with const-init (destructor runs via `Drop`)
//! - neither: one process-wide [`LocalAllocator`] behind a spinlock

use crate::core_allocator::CoreAllocator;
use crate::local_allocator::LocalAllocator;
use crate::pagemap;
use crate::size_class::{self, MAX_SMALL_SIZE};
use crate::{hist_record, stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// Alignment every allocation is guaranteed to satisfy regardless of the
/// requested `Layout`, matching the platform C library's default so callers
/// that rely on `malloc`'s implicit guarantee aren't surprised.
pub const MALLOC_ALIGN: usize = 2 * core::mem::size_of::<usize>();

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static mut LOCAL: LocalAllocator = LocalAllocator::new_const();

        #[inline(always)]
        unsafe fn with_local<R>(f: impl FnOnce(&mut LocalAllocator) -> R) -> R {
            ensure_registered();
            f(unsafe { &mut *ptr::addr_of_mut!(LOCAL) })
        }

        // -- Teardown notification: nightly + std --
        #[cfg(feature = "std")]
        mod cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    unsafe { (*core::ptr::addr_of_mut!(super::LOCAL)).teardown() };
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // If std's TLS machinery is already tearing down (rare, at
                // process exit), silently skip: the bound core allocator
                // just stays `in_use` forever, which `pool` already treats
                // as a safe fallback.
                let _ = GUARD.try_with(|_| {});
            }
        }

        // -- Teardown notification: nightly, no std --
        // No thread-exit hook is available; the bound core allocator is
        // simply never released back to the pool (see `pool`'s doc comment).
        #[cfg(not(feature = "std"))]
        mod cleanup {
            pub(super) fn register() {}
        }

        #[inline(always)]
        unsafe fn ensure_registered() {
            cleanup::register();
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static LOCAL: core::cell::UnsafeCell<LocalAllocator> = const {
                core::cell::UnsafeCell::new(LocalAllocator::new_const())
            };
        }

        #[inline(always)]
        unsafe fn with_local<R>(f: impl FnOnce(&mut LocalAllocator) -> R) -> R {
            match LOCAL.try_with(|cell| f(unsafe { &mut *cell.get() })) {
                Ok(r) => r,
                Err(_) => crate::platform::error("allocator: thread-local storage unavailable"),
            }
        }
    } else {
        static LOCAL: crate::sync::SpinMutex<LocalAllocator> =
            crate::sync::SpinMutex::new(LocalAllocator::new_const());

        #[inline(always)]
        unsafe fn with_local<R>(f: impl FnOnce(&mut LocalAllocator) -> R) -> R {
            let mut guard = LOCAL.lock();
            f(&mut guard)
        }
    }
}

pub(crate) unsafe fn alloc_inner(size: usize, align: usize) -> *mut u8 {
    if size == 0 {
        return align.max(1) as *mut u8;
    }

    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    hist_record!(size);

    if align <= MALLOC_ALIGN && size <= MAX_SMALL_SIZE {
        let class = size_class::size_to_sizeclass(size);
        let rsize = size_class::sizeclass_to_size(class);
        if rsize % align == 0 {
            stat_inc!(small_alloc_count);
            return unsafe { with_local(|local| local.alloc_small(class)) };
        }
    }

    let effective = size.max(align);
    if align <= crate::config::MIN_CHUNK_SIZE && effective <= MAX_SMALL_SIZE {
        let class = size_class::size_to_sizeclass(effective);
        let rsize = size_class::sizeclass_to_size(class);
        if rsize % align == 0 {
            stat_inc!(small_alloc_count);
            return unsafe { with_local(|local| local.alloc_small(class)) };
        }
    }

    // Either larger than the small-object ceiling, or over-aligned beyond
    // what a slab offset can satisfy. Chunks handed out by the chunk
    // allocator are always aligned to their own (power-of-two) size, so
    // rounding up to the larger of `size`/`align` satisfies both at once.
    let rounded = effective
        .next_power_of_two()
        .max(crate::config::MIN_CHUNK_SIZE);
    stat_inc!(large_alloc_count);
    CoreAllocator::large_alloc(rounded)
}

pub(crate) unsafe fn dealloc_inner(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    stat_inc!(dealloc_count);
    unsafe { with_local(|local| local.dealloc(ptr)) };
}

/// Usable size of a live allocation, looked up from the pagemap rather than
/// trusting a caller-supplied `Layout` (a prior `realloc` may have returned
/// the same pointer for an in-place shrink, leaving the caller's notion of
/// the size smaller than what's actually backing it).
pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let entry = pagemap::global().get(ptr as usize);
    if entry.is_fake_large() {
        1usize << entry.sizeclass
    } else if !entry.metaslab.is_null() {
        let meta = entry.metaslab.cast::<crate::slab::Metaslab>();
        size_class::sizeclass_to_size(unsafe { (*meta).sizeclass() })
    } else {
        0
    }
}

pub(crate) unsafe fn realloc_inner(ptr: *mut u8, align: usize, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return unsafe { alloc_inner(new_size, align) };
    }
    if new_size == 0 {
        unsafe { dealloc_inner(ptr) };
        return align.max(1) as *mut u8;
    }

    stat_inc!(realloc_count);
    let old_usable = usable_size(ptr);

    // Already fits (including an in-place shrink that stays in the same
    // size class, or within the same large-object chunk): keep the pointer.
    if new_size <= old_usable {
        return ptr;
    }

    let new_ptr = unsafe { alloc_inner(new_size, align) };
    if !new_ptr.is_null() {
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
        unsafe { dealloc_inner(ptr) };
    }
    new_ptr
}

/// Zero-sized handle implementing [`GlobalAlloc`] over the whole allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: coremalloc::CoreMalloc = coremalloc::CoreMalloc;
/// ```
pub struct CoreMalloc;

unsafe impl GlobalAlloc for CoreMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { alloc_inner(layout.size(), layout.align()) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { dealloc_inner(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { realloc_inner(ptr, layout.align(), new_size) }
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for CoreMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}

/// Force the chunk allocator's epoch decay to run once, right now, instead
/// of waiting for the background timer. Primarily useful for embeddings
/// with no timer facility (`std` disabled) and for tests that want
/// deterministic reclaim without sleeping.
pub fn cleanup_unused() {
    crate::chunk_allocator::global().decay_now();
}

/// True once every core allocator ever minted has fully drained: no slab
/// sitting in a woken state, nothing outstanding in any remote inbox. Used
/// by test tooling to check for leaks; not meaningful while other threads
/// are concurrently allocating.
pub fn debug_check_empty() -> bool {
    let mut all_empty = true;
    crate::pool::global().for_each(|core| {
        all_empty &= core.debug_check_empty();
    });
    all_empty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dealloc_small_round_trips() {
        let a = CoreMalloc;
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { a.dealloc(ptr, layout) };
    }

    #[test]
    fn alloc_zeroed_is_actually_zero() {
        let a = CoreMalloc;
        let layout = Layout::from_size_align(256, 8).unwrap();
        let ptr = unsafe { a.alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        for i in 0..256 {
            assert_eq!(unsafe { *ptr.add(i) }, 0);
        }
        unsafe { a.dealloc(ptr, layout) };
    }

    #[test]
    fn realloc_in_place_same_class_keeps_pointer() {
        let a = CoreMalloc;
        let layout = Layout::from_size_align(8, 8).unwrap();
        let ptr = unsafe { a.alloc(layout) };
        let grown = unsafe { a.realloc(ptr, layout, 12) };
        assert_eq!(ptr, grown, "growing within the same size class should not move");
        unsafe { a.dealloc(grown, Layout::from_size_align(12, 8).unwrap()) };
    }

    #[test]
    fn realloc_across_classes_preserves_contents() {
        let a = CoreMalloc;
        let layout = Layout::from_size_align(8, 8).unwrap();
        let ptr = unsafe { a.alloc(layout) };
        unsafe { ptr::write_bytes(ptr, 0xAB, 8) };
        let bigger = unsafe { a.realloc(ptr, layout, 4096) };
        assert!(!bigger.is_null());
        for i in 0..8 {
            assert_eq!(unsafe { *bigger.add(i) }, 0xAB);
        }
        unsafe { a.dealloc(bigger, Layout::from_size_align(4096, 8).unwrap()) };
    }

    #[test]
    fn small_alloc_honors_alignment_above_natural_rsize() {
        // Several of these land on a size class whose rounded `rsize` is
        // only 8-aligned (24, 40, 56, ...); the fast path must fall
        // through rather than hand out an under-aligned pointer.
        let a = CoreMalloc;
        for &(size, align) in &[(17usize, 16usize), (20, 16), (33, 32), (48, 32)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { a.alloc(layout) };
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0, "size={size} align={align}");
            unsafe { a.dealloc(ptr, layout) };
        }
    }

    #[test]
    fn large_alloc_is_chunk_aligned() {
        let a = CoreMalloc;
        let layout = Layout::from_size_align(crate::config::MIN_CHUNK_SIZE * 2, 8).unwrap();
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % (crate::config::MIN_CHUNK_SIZE * 2), 0);
        unsafe { a.dealloc(ptr, layout) };
    }
}
