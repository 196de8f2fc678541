//! Thread-local fast path.
//!
//! One instance of [`LocalAllocator`] lives per thread (see `allocator.rs`
//! for the TLS plumbing that selects how, depending on which of
//! `nightly`/`std` is enabled). It is deliberately thin: a per-size-class
//! free list cache fed by its bound [`CoreAllocator`]'s `refill`, plus a
//! one-destination remote-free batching cache so that a burst of frees
//! headed for the same other-thread core allocator costs one CAS instead
//! of one per object.
//!
//! Lazily binds to a core allocator on first use ([`LocalAllocator::init`]
//! via [`pool::global`]); [`LocalAllocator::teardown`] unwinds that binding
//! at thread exit, returning every cached object to its home slab first so
//! nothing the pagemap still thinks is "allocated" goes missing.

use crate::core_allocator::CoreAllocator;
use crate::pagemap;
use crate::pool;
use crate::size_class::NUM_SIZE_CLASSES;
use crate::stat_inc;
use core::ptr;

pub struct LocalAllocator {
    core: *mut CoreAllocator,
    free_lists: [*mut u8; NUM_SIZE_CLASSES],
    remote_dest: *mut CoreAllocator,
    remote_head: *mut u8,
    remote_tail: *mut u8,
}

// Exclusively owned by the thread it's bound to; handed across threads
// only as part of TLS teardown machinery moving the whole value, never
// shared.
unsafe impl Send for LocalAllocator {}

impl LocalAllocator {
    pub const fn new_const() -> Self {
        Self {
            core: ptr::null_mut(),
            free_lists: [ptr::null_mut(); NUM_SIZE_CLASSES],
            remote_dest: ptr::null_mut(),
            remote_head: ptr::null_mut(),
            remote_tail: ptr::null_mut(),
        }
    }

    #[inline]
    fn ensure_init(&mut self) {
        if self.core.is_null() {
            self.core = pool::global().acquire();
        }
    }

    /// Fast-path small allocation: pop from this thread's cached free list
    /// for `sizeclass`, refilling from the bound core allocator on a miss.
    #[inline]
    pub fn alloc_small(&mut self, sizeclass: u8) -> *mut u8 {
        self.ensure_init();
        let head = self.free_lists[sizeclass as usize];
        if !head.is_null() {
            let next = unsafe { *(head as *mut *mut u8) };
            self.free_lists[sizeclass as usize] = next;
            stat_inc!(local_free_list_hits);
            return head;
        }
        stat_inc!(local_free_list_misses);
        self.refill_and_take(sizeclass)
    }

    /// Returns null ([`crate::error::AllocError::OutOfMemory`]) if the
    /// bound core allocator couldn't mint a fresh slab; propagates
    /// straight up to the caller's `alloc`, same as any other allocation
    /// failure.
    #[cold]
    fn refill_and_take(&mut self, sizeclass: u8) -> *mut u8 {
        let core = unsafe { &mut *self.core };
        let (head, rest) = core.refill(sizeclass);
        self.free_lists[sizeclass as usize] = rest;
        head
    }

    /// Free an object of any kind (small or large). Routes small objects
    /// back to their owning core allocator — directly if it's this
    /// thread's own, otherwise via the remote-free batching cache.
    pub fn dealloc(&mut self, ptr: *mut u8) {
        let entry = pagemap::global().get(ptr as usize);
        if entry.is_fake_large() {
            unsafe { CoreAllocator::large_dealloc(ptr) };
            return;
        }
        if entry.metaslab.is_null() {
            crate::platform::error("dealloc: pointer not owned by this allocator");
        }
        let owner = entry.remote.cast::<CoreAllocator>();
        self.ensure_init();
        if owner == self.core {
            let core = unsafe { &mut *self.core };
            core.dealloc_local(ptr, entry.metaslab.cast());
            stat_inc!(local_dealloc_count);
        } else {
            self.post_remote(owner, ptr);
            stat_inc!(remote_post_count);
        }
    }

    fn post_remote(&mut self, owner: *mut CoreAllocator, obj: *mut u8) {
        if self.remote_dest != owner && !self.remote_head.is_null() {
            self.flush_remote();
        }
        self.remote_dest = owner;
        unsafe { *(obj as *mut *mut u8) = self.remote_head };
        if self.remote_head.is_null() {
            self.remote_tail = obj;
        }
        self.remote_head = obj;
    }

    /// Flush the accumulated remote-free batch, if any, to its destination
    /// core allocator in one push.
    pub fn flush_remote(&mut self) {
        if self.remote_head.is_null() {
            return;
        }
        let dest = unsafe { &*self.remote_dest };
        unsafe { dest.post_remote_batch(self.remote_head, self.remote_tail) };
        stat_inc!(remote_flush_count);
        self.remote_head = ptr::null_mut();
        self.remote_tail = ptr::null_mut();
    }

    /// Return every cached-but-unhanded-out object to its home slab, flush
    /// pending remote frees, and release the bound core allocator back to
    /// the pool. Called once at thread exit.
    pub fn teardown(&mut self) {
        if self.core.is_null() {
            return;
        }
        let core = unsafe { &mut *self.core };
        for sizeclass in 0..NUM_SIZE_CLASSES {
            let mut head = self.free_lists[sizeclass];
            self.free_lists[sizeclass] = ptr::null_mut();
            while !head.is_null() {
                let next = unsafe { *(head as *mut *mut u8) };
                let entry = pagemap::global().get(head as usize);
                core.dealloc_local(head, entry.metaslab.cast());
                head = next;
            }
        }
        self.flush_remote();
        unsafe { pool::global().release(self.core) };
        self.core = ptr::null_mut();
    }
}

impl Drop for LocalAllocator {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_dealloc_same_thread_round_trips() {
        let mut local = LocalAllocator::new_const();
        let p = local.alloc_small(1);
        assert!(!p.is_null());
        local.dealloc(p);
        local.teardown();
    }

    #[test]
    fn large_allocations_skip_the_local_cache() {
        let mut local = LocalAllocator::new_const();
        let ptr = CoreAllocator::large_alloc(crate::config::MIN_CHUNK_SIZE * 2);
        local.dealloc(ptr);
        local.teardown();
    }
}
