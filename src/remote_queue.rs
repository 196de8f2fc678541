//! The remote-free message queue: a lock-free, single-consumer/
//! multi-producer channel that routes a cross-thread free back to the
//! slab that owns the object, without the freeing thread ever taking a
//! lock.
//!
//! A "message" is nothing more than the freed object pointer itself,
//! reusing the same first-word-is-next-pointer representation the slab's
//! own free lists use (every object is at least pointer-sized, per the
//! size-class table's minimum allocation size) — see the design notes on
//! avoiding ad-hoc intrusive tricks: rather than stashing a tag in spare
//! pointer bits, the queue is just [`crate::sync::LockFreeStack`] over a
//! transparent node view of the object, and any size-class bookkeeping is
//! recovered separately, by a pagemap lookup, once a message is drained.
//!
//! Producers (any thread, including the owner itself) post a single
//! object or a pre-linked batch; only the owning core allocator ever
//! drains, and only when it needs to make progress or on an explicit
//! flush.

use crate::sync::{LockFreeStack, StackNode};
use core::sync::atomic::AtomicPtr;

/// Transparent view of a freed object used only to thread it through the
/// queue's intrusive "next" link.
#[repr(transparent)]
struct RemoteNode(AtomicPtr<RemoteNode>);

impl StackNode for RemoteNode {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.0
    }
}

/// One core allocator's inbox for remote frees.
pub struct RemoteQueue {
    stack: LockFreeStack<RemoteNode>,
}

impl Default for RemoteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteQueue {
    pub const fn new() -> Self {
        Self {
            stack: LockFreeStack::new(),
        }
    }

    /// Post a single freed object.
    ///
    /// # Safety
    /// `obj` must be a live, exclusively-surrendered allocation pointer at
    /// least pointer-sized and pointer-aligned.
    #[inline]
    pub unsafe fn post(&self, obj: *mut u8) {
        unsafe { self.stack.push(obj.cast::<RemoteNode>()) };
    }

    /// Post a pre-linked batch `head -> .. -> tail` (via the same
    /// first-word-next representation) in one CAS.
    ///
    /// # Safety
    /// The chain from `head` to `tail` must already be linked that way and
    /// exclusively owned by the caller.
    #[inline]
    pub unsafe fn post_batch(&self, head: *mut u8, tail: *mut u8) {
        unsafe {
            self.stack
                .push_batch(head.cast::<RemoteNode>(), tail.cast::<RemoteNode>())
        };
    }

    /// Atomically take every message posted so far, returning the head of
    /// the drained chain (walk it with [`next`]). Only the owning core
    /// allocator calls this.
    #[inline]
    pub fn drain(&self) -> *mut u8 {
        self.stack.take_all().cast::<u8>()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Read the "next" link of a drained message, to walk the chain returned
/// by [`RemoteQueue::drain`].
///
/// # Safety
/// `obj` must be a non-null pointer previously drained from a
/// [`RemoteQueue`] (or the original `tail` of a chain being walked).
#[inline]
pub unsafe fn next(obj: *mut u8) -> *mut u8 {
    unsafe { (*obj.cast::<RemoteNode>()).0.load(core::sync::atomic::Ordering::Relaxed) }.cast::<u8>()
}

/// Invoke `f` once per message in a chain returned by
/// [`RemoteQueue::drain`].
///
/// # Safety
/// `head` must be null or a chain previously drained from a
/// [`RemoteQueue`].
pub unsafe fn for_each(mut head: *mut u8, mut f: impl FnMut(*mut u8)) {
    while !head.is_null() {
        let n = unsafe { next(head) };
        f(head);
        head = n;
    }
}
