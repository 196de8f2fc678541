//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a simple test-and-set spinlock and a `SpinMutex<T>` wrapper.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin while locked (read-only, doesn't invalidate cache line)
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// Intrusive node for [`LockFreeStack`]. Implementors own one atomic "next"
/// link that the stack threads through freely; nothing else touches it.
pub trait StackNode {
    fn next_link(&self) -> &AtomicPtr<Self>
    where
        Self: Sized;
}

/// A Treiber stack over intrusively-linked nodes. No allocation, no locks;
/// push/pop are lock-free CAS loops.
///
/// Callers own node lifetime: a popped node must not be pushed again until
/// the caller is done with it (this stack has no hazard-pointer or epoch
/// reclamation of its own — it relies on the allocator's single-owner
/// handoff discipline to avoid ABA).
pub struct LockFreeStack<T> {
    head: core::sync::atomic::AtomicPtr<T>,
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StackNode> LockFreeStack<T> {
    pub const fn new() -> Self {
        Self {
            head: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Push a single node.
    ///
    /// # Safety
    /// `node` must be a valid, exclusively-owned pointer that the caller no
    /// longer touches until a subsequent `pop` returns it.
    pub unsafe fn push(&self, node: *mut T) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next_link().store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Push a pre-linked chain `batch_head -> .. -> batch_tail` in one CAS.
    /// `batch_tail`'s next link is overwritten to point at the prior head.
    ///
    /// # Safety
    /// The chain from `batch_head` to `batch_tail` must already be linked
    /// via `next_link`, and exclusively owned by the caller.
    pub unsafe fn push_batch(&self, batch_head: *mut T, batch_tail: *mut T) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*batch_tail).next_link().store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                batch_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Pop one node, or null if the stack is empty.
    pub fn pop(&self) -> *mut T {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return core::ptr::null_mut();
            }
            let next = unsafe { (*head).next_link().load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return head,
                Err(h) => head = h,
            }
        }
    }

    /// Atomically take the whole stack, leaving it empty. Returns the old
    /// head; the caller walks it via `next_link`.
    pub fn take_all(&self) -> *mut T {
        self.head.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}
