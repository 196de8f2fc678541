//! Core allocator: owns the slabs backing one "core" (in practice, one
//! thread-bound [`crate::local_allocator::LocalAllocator`] at a time, via
//! [`crate::pool`]).
//!
//! Per size class it keeps a list of woken slabs with accumulated free
//! capacity ready to hand out ([`Metaslab::alloc_from`]), and mints a
//! brand-new slab from the chunk allocator when that list runs dry. Frees
//! from the core allocator's own thread return straight to the owning
//! slab; frees from any other thread are posted to this core allocator's
//! [`crate::remote_queue::RemoteQueue`] and only applied when this core
//! allocator next drains it (on its own next allocation, or an explicit
//! flush) — the remote queue is the only point of cross-thread contention
//! in the whole free path.
//!
//! Large allocations (`>= MAX_SMALL_SIZE`) bypass slabs entirely: a whole
//! chunk-or-larger block backs exactly one allocation, tagged in the
//! pagemap via [`crate::pagemap::fake_large_remote`], and can be freed by
//! any thread directly (there is no slab state to protect).

use crate::address_space;
use crate::chunk_allocator;
use crate::config::HARDENED_DEFAULT;
use crate::pagemap::{self, MetaEntry};
use crate::platform;
use crate::remote_queue::{self, RemoteQueue};
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::slab::{Entropy, Metaslab};
use crate::stat_inc;
use crate::sync::StackNode;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct PerClass {
    /// Slabs that have been woken (crossed the wake threshold on the free
    /// side) and have not yet been drained dry again.
    sleeping: *mut Metaslab,
}

impl PerClass {
    const fn empty() -> Self {
        Self {
            sleeping: ptr::null_mut(),
        }
    }
}

/// One "core" worth of allocator state: a private set of slabs plus an
/// inbox for frees posted by other threads.
pub struct CoreAllocator {
    classes: [PerClass; NUM_SIZE_CLASSES],
    remote: RemoteQueue,
    entropy: Entropy,
    hardened: bool,
    /// Guards exclusive ownership while handed out by [`crate::pool`].
    pub(crate) in_use: AtomicBool,
    /// Link for the pool's reuse stack.
    pool_next: AtomicPtr<CoreAllocator>,
    /// Link for the pool's append-only "every allocator ever created" list.
    pub(crate) all_next: AtomicPtr<CoreAllocator>,
}

// Mutated only by the thread that currently owns it (via the pool); moved
// across threads solely as a whole-value handoff.
unsafe impl Send for CoreAllocator {}
unsafe impl Sync for CoreAllocator {}

impl StackNode for CoreAllocator {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.pool_next
    }
}

impl CoreAllocator {
    pub fn new(seed: usize) -> Self {
        const EMPTY: PerClass = PerClass::empty();
        Self {
            classes: [EMPTY; NUM_SIZE_CLASSES],
            remote: RemoteQueue::new(),
            entropy: Entropy::new(seed),
            hardened: HARDENED_DEFAULT,
            in_use: AtomicBool::new(false),
            pool_next: AtomicPtr::new(ptr::null_mut()),
            all_next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Post a free for an object this core allocator owns, from any
    /// thread (including its own — the owner just drains its own queue on
    /// the next refill rather than short-circuiting, to keep one code
    /// path).
    ///
    /// # Safety
    /// `obj` must be a live small allocation this core allocator owns.
    pub unsafe fn post_remote(&self, obj: *mut u8) {
        unsafe { self.remote.post(obj) };
    }

    /// Post a pre-linked batch of frees in one CAS, for callers (the local
    /// allocator's per-destination remote cache) that have accumulated
    /// several frees for the same owner before flushing.
    ///
    /// # Safety
    /// Same as [`Self::post_remote`], for every object in the chain.
    pub unsafe fn post_remote_batch(&self, head: *mut u8, tail: *mut u8) {
        unsafe { self.remote.post_batch(head, tail) };
    }

    /// Refill the caller's (the local allocator's) free list for
    /// `sizeclass`: hand back one object immediately, plus the rest of
    /// whatever batch was available. Returns `(null, null)`
    /// ([`crate::error::AllocError::OutOfMemory`]) if no sleeping slab had
    /// capacity and the backend refused to mint a fresh one.
    pub fn refill(&mut self, sizeclass: u8) -> (*mut u8, *mut u8) {
        self.drain_remote();

        let pc = &mut self.classes[sizeclass as usize];
        while !pc.sleeping.is_null() {
            let candidate = pc.sleeping;
            pc.sleeping = unsafe { (*candidate).next() };
            unsafe { (*candidate).set_next(ptr::null_mut()) };
            unsafe { (*candidate).wake() };
            if let Some(batch) = unsafe { (*candidate).alloc_from() } {
                return batch;
            }
            // Woken but nothing had accumulated after all (shouldn't
            // normally happen); try the next sleeping slab.
        }

        self.new_slab(sizeclass)
            .unwrap_or((ptr::null_mut(), ptr::null_mut()))
    }

    /// Drain this core allocator's remote-free inbox, applying every
    /// message to the slab it targets.
    pub fn drain_remote(&mut self) {
        let head = self.remote.drain();
        if head.is_null() {
            return;
        }
        stat_inc!(remote_drain_count);
        let self_ptr: *mut CoreAllocator = self;
        unsafe {
            remote_queue::for_each(head, |obj| {
                (*self_ptr).apply_remote_free(obj);
            });
        }
    }

    fn apply_remote_free(&mut self, obj: *mut u8) {
        let entry = pagemap::global().get(obj as usize);
        if entry.metaslab.is_null() {
            platform::error("core_allocator: remote free for unowned object");
        }
        let meta = entry.metaslab.cast::<Metaslab>();
        let sizeclass = unsafe { (*meta).sizeclass() };
        let signalled = unsafe { (*meta).return_object(obj) };
        if signalled {
            self.on_slab_signalled(sizeclass, meta);
        }
    }

    /// `return_object` just reported that `needed` reached zero: either
    /// the slab is now fully unused (every object freed — reclaim the
    /// whole chunk) or it has accumulated enough returns to be worth
    /// waking up again.
    fn on_slab_signalled(&mut self, sizeclass: u8, meta: *mut Metaslab) {
        if unsafe { (*meta).is_unused() } {
            self.reclaim_slab(sizeclass, meta);
        } else {
            let pc = &mut self.classes[sizeclass as usize];
            unsafe { (*meta).set_next(pc.sleeping) };
            pc.sleeping = meta;
        }
    }

    fn reclaim_slab(&mut self, sizeclass: u8, meta: *mut Metaslab) {
        stat_inc!(slab_reclaim_count);
        let chunk = unsafe { (*meta).chunk() };
        let slab_size = size_class::sizeclass_to_slab_size(sizeclass);
        pagemap::global().set(chunk as usize, slab_size, MetaEntry::EMPTY);
        chunk_allocator::global().dealloc(chunk, slab_size);
        address_space::global().add_range(
            meta as usize,
            core::mem::size_of::<Metaslab>().max(8),
        );
    }

    /// Free an object allocated on this same thread: fast, lock-free,
    /// never touches the remote queue.
    pub fn dealloc_local(&mut self, obj: *mut u8, meta: *mut Metaslab) {
        let sizeclass = unsafe { (*meta).sizeclass() };
        let signalled = unsafe { (*meta).return_object(obj) };
        if signalled {
            self.on_slab_signalled(sizeclass, meta);
        }
    }

    /// Mint a brand-new slab for `sizeclass`. Returns `None`
    /// ([`crate::error::AllocError::OutOfMemory`]) if the chunk allocator
    /// has no fresh chunk to hand over.
    fn new_slab(&mut self, sizeclass: u8) -> Option<(*mut u8, *mut u8)> {
        stat_inc!(slab_mint_count);
        let slab_size = size_class::sizeclass_to_slab_size(sizeclass);
        let chunk = chunk_allocator::global().alloc_chunk(slab_size);
        if chunk.is_null() {
            return None;
        }
        let header = Self::alloc_metaslab_header();
        unsafe { ptr::write(header, Metaslab::uninit()) };
        unsafe { (*header).initialise(sizeclass, chunk) };

        pagemap::global().set(
            chunk as usize,
            slab_size,
            MetaEntry {
                metaslab: header.cast::<u8>(),
                remote: self as *mut CoreAllocator as *mut u8,
                sizeclass,
            },
        );

        Some(unsafe { (*header).populate_fresh(chunk, self.hardened, &mut self.entropy) })
    }

    /// Carve a `Metaslab` header out of the (separately reserved, much
    /// smaller) meta-data address range. Exhausting this range is treated
    /// as fatal rather than a recoverable `OutOfMemory`: it would only
    /// happen well before the data-chunk address space itself is
    /// exhausted, so in practice it signals something has gone wrong
    /// rather than ordinary resource pressure.
    fn alloc_metaslab_header() -> *mut Metaslab {
        let size = core::mem::size_of::<Metaslab>().max(8);
        let base = address_space::global()
            .reserve_with_left_over(size)
            .unwrap_or_else(|| platform::error("core_allocator: out of meta-data space"));
        base as *mut Metaslab
    }

    /// Allocate a large (`>= MAX_SMALL_SIZE`) object directly from the
    /// chunk allocator; no slab involved. Returns null
    /// ([`crate::error::AllocError::OutOfMemory`]) if the chunk allocator
    /// has nothing to hand over.
    pub fn large_alloc(size: usize) -> *mut u8 {
        let rounded = size
            .next_power_of_two()
            .max(crate::config::MIN_CHUNK_SIZE);
        let chunk = chunk_allocator::global().alloc_chunk(rounded);
        if chunk.is_null() {
            return ptr::null_mut();
        }
        let sizeclass = rounded.trailing_zeros() as u8;
        pagemap::global().set(
            chunk as usize,
            rounded,
            MetaEntry {
                metaslab: ptr::null_mut(),
                remote: pagemap::fake_large_remote(),
                sizeclass,
            },
        );
        chunk
    }

    /// Free a large allocation. Safe from any thread.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by [`Self::large_alloc`].
    pub unsafe fn large_dealloc(ptr: *mut u8) {
        let entry = pagemap::global().get(ptr as usize);
        debug_assert!(entry.is_fake_large());
        let size = 1usize << entry.sizeclass;
        pagemap::global().set(ptr as usize, size, MetaEntry::EMPTY);
        chunk_allocator::global().dealloc(ptr, size);
    }

    /// True once every slab this core allocator owns has been fully
    /// drained and there is nothing outstanding in its remote inbox.
    /// Used by test tooling to check for leaks at teardown.
    pub fn debug_check_empty(&self) -> bool {
        self.remote.is_empty() && self.classes.iter().all(|pc| pc.sleeping.is_null())
    }
}
