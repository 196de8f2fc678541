//! Pool of reusable [`CoreAllocator`]s.
//!
//! A thread binds to a core allocator for as long as it's running (see
//! [`crate::local_allocator`]) and gives it back when it exits (or, on
//! platforms without thread-exit notification, never — it simply stays
//! `in_use` forever, which is safe, just not maximally memory-efficient).
//! Core allocators are never freed once minted: a freed thread's
//! accumulated slabs are still perfectly good for the next thread that
//! picks up the same core allocator, so reuse rather than teardown is the
//! only path.
//!
//! Two lists share the same set of objects for two different purposes:
//! - `free`, a [`LockFreeStack`] of allocators currently not owned by any
//!   thread, popped by `acquire` and pushed back by `release`;
//! - `all_head`, an append-only chain of every allocator ever minted,
//!   walked (never popped) by callers that need to visit every core
//!   allocator regardless of who currently owns it (a process-wide debug
//!   check, for instance).

use crate::address_space;
use crate::core_allocator::CoreAllocator;
use crate::platform;
use crate::sync::LockFreeStack;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub struct Pool {
    free: LockFreeStack<CoreAllocator>,
    all_head: AtomicPtr<CoreAllocator>,
    seed: AtomicUsize,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub const fn new() -> Self {
        Self {
            free: LockFreeStack::new(),
            all_head: AtomicPtr::new(ptr::null_mut()),
            seed: AtomicUsize::new(1),
        }
    }

    /// Acquire a core allocator for exclusive use by the calling thread:
    /// reuse one sitting idle in the pool, or mint a fresh one.
    pub fn acquire(&self) -> *mut CoreAllocator {
        let mut core = self.free.pop();
        if core.is_null() {
            core = self.mint_new();
        }
        unsafe {
            if (*core).in_use.swap(true, Ordering::AcqRel) {
                platform::error("pool: double-acquired core allocator");
            }
        }
        core
    }

    /// Release a core allocator back to the pool for another thread to
    /// pick up.
    ///
    /// # Safety
    /// `core` must be a pointer previously returned by [`Self::acquire`],
    /// not currently referenced by anyone else.
    pub unsafe fn release(&self, core: *mut CoreAllocator) {
        unsafe {
            if !(*core).in_use.swap(false, Ordering::AcqRel) {
                platform::error("pool: double-released core allocator");
            }
            self.free.push(core);
        }
    }

    fn mint_new(&self) -> *mut CoreAllocator {
        let seed = self.seed.fetch_add(1, Ordering::Relaxed);
        let size = core::mem::size_of::<CoreAllocator>().max(8);
        let base = address_space::global()
            .reserve_with_left_over(size)
            .unwrap_or_else(|| platform::error("pool: out of meta-data space"));
        let ptr = base as *mut CoreAllocator;
        unsafe { ptr::write(ptr, CoreAllocator::new(seed)) };

        let mut head = self.all_head.load(Ordering::Relaxed);
        loop {
            unsafe { (*ptr).all_next.store(head, Ordering::Relaxed) };
            match self.all_head.compare_exchange_weak(
                head,
                ptr,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        ptr
    }

    /// Visit every core allocator ever minted, regardless of current
    /// ownership. Used by debug/teardown tooling; never mutates the pool.
    pub fn for_each<F: FnMut(&CoreAllocator)>(&self, mut f: F) {
        let mut cur = self.all_head.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                f(&*cur);
                cur = (*cur).all_next.load(Ordering::Acquire);
            }
        }
    }
}

static GLOBAL: Pool = Pool::new();

/// Accessor for the process-wide core-allocator pool.
#[inline]
pub fn global() -> &'static Pool {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_is_reused() {
        let pool = Pool::new();
        let a = pool.acquire();
        unsafe { pool.release(a) };
        let b = pool.acquire();
        assert_eq!(a, b, "released allocator should be handed back out");
        unsafe { pool.release(b) };
    }

    #[test]
    fn concurrent_acquire_never_double_hands_out() {
        let pool = std::sync::Arc::new(Pool::new());
        let handles: std::vec::Vec<_> = (0..8)
            .map(|_| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    let core = pool.acquire();
                    assert!(unsafe { (*core).in_use.load(Ordering::Relaxed) });
                    unsafe { pool.release(core) };
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn for_each_visits_every_minted_allocator() {
        let pool = Pool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        unsafe {
            pool.release(a);
            pool.release(b);
        }
        let mut count = 0;
        pool.for_each(|_| count += 1);
        assert_eq!(count, 2);
    }
}
