//! Chunk allocator: a cache of freed, chunk-granularity (or larger,
//! power-of-two) blocks sitting above [`crate::address_space`], so that a
//! slab or large allocation being freed and immediately reused doesn't pay
//! for a fresh reservation and a fresh commit every time.
//!
//! Freed chunks are bucketed two ways: by `log2(size)` (a chunk handed back
//! from a slab sized for size class N is not interchangeable with one sized
//! for size class M), and by the epoch they were freed in. A background
//! timer (or an explicit [`ChunkAllocator::decay_now`] call, for
//! embeddings with no timer facility) periodically advances the epoch;
//! whatever is sitting in the bucket about to be reused gets decommitted
//! (pages handed back to the OS, reservation kept) and moved to a separate,
//! epoch-less decommitted list. This bounds how long a freed chunk can sit
//! fully resident before the allocator gives the pages back, without
//! decommitting on every single free (which would make a free-then-alloc
//! churn pattern pay for a page fault every time).
//!
//! Freed chunks thread their free-list "next" pointer through their own
//! first word, the same convention [`crate::slab`] and
//! [`crate::remote_queue`] use: a chunk sitting in one of these caches is
//! otherwise completely unused memory.

use crate::address_space;
use crate::config::{DECAY_PERIOD_MS, MIN_CHUNK_SIZE, NUM_EPOCHS};
use crate::platform;
use crate::stat_inc;
use crate::sync::{LockFreeStack, StackNode};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

const BITS: usize = usize::BITS as usize;

#[repr(transparent)]
struct ChunkNode(AtomicPtr<ChunkNode>);

impl StackNode for ChunkNode {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.0
    }
}

struct SizeBuckets {
    by_size: [LockFreeStack<ChunkNode>; BITS],
}

impl SizeBuckets {
    const fn new() -> Self {
        const EMPTY: LockFreeStack<ChunkNode> = LockFreeStack::new();
        Self {
            by_size: [EMPTY; BITS],
        }
    }
}

/// Epoch- and size-bucketed cache of freed chunks.
pub struct ChunkAllocator {
    epochs: [SizeBuckets; NUM_EPOCHS],
    decommitted: SizeBuckets,
    current_epoch: AtomicUsize,
    timer_started: AtomicBool,
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAllocator {
    pub const fn new() -> Self {
        const EMPTY_BUCKET: SizeBuckets = SizeBuckets::new();
        Self {
            epochs: [EMPTY_BUCKET; NUM_EPOCHS],
            decommitted: SizeBuckets::new(),
            current_epoch: AtomicUsize::new(0),
            timer_started: AtomicBool::new(false),
        }
    }

    /// Start the background decay timer, once per process. Safe to call
    /// from every thread that touches the allocator; only the first call
    /// does anything.
    pub fn ensure_decay_timer(&'static self) {
        if self
            .timer_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
            && !platform::register_timer(DECAY_PERIOD_MS, tick)
        {
            // No timer facility in this embedding; leave `timer_started`
            // set so we don't retry every call, and rely on callers
            // invoking `decay_now` explicitly (e.g. via `cleanup_unused`).
        }
    }

    /// Obtain a chunk of exactly `size` bytes (a power of two, at least
    /// [`MIN_CHUNK_SIZE`]), committed and ready to use. Reuses a cached
    /// chunk of the same size if one is available in any epoch bucket or
    /// the decommitted list, falling back to a fresh address-space
    /// reservation. Returns null ([`crate::error::AllocError::OutOfMemory`])
    /// if the platform refuses a fresh reservation and nothing cached
    /// satisfies the request.
    pub fn alloc_chunk(&self, size: usize) -> *mut u8 {
        debug_assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);
        let bucket = size.trailing_zeros() as usize;

        for e in self.epochs.iter() {
            let ptr = e.by_size[bucket].pop();
            if !ptr.is_null() {
                stat_inc!(chunk_cache_hits);
                return ptr.cast::<u8>();
            }
        }

        let from_decommitted = self.decommitted.by_size[bucket].pop();
        if !from_decommitted.is_null() {
            stat_inc!(chunk_cache_hits);
            let p = from_decommitted.cast::<u8>();
            unsafe { platform::notify_using(p, size) };
            return p;
        }

        stat_inc!(chunk_cache_misses);
        let base = match address_space::global().reserve(size) {
            Some(b) => b,
            None => return ptr::null_mut(),
        };
        address_space::global().commit_block(base, size);
        base as *mut u8
    }

    /// Return a chunk of `size` bytes to the cache, tagging it with the
    /// current epoch.
    pub fn dealloc(&self, chunk: *mut u8, size: usize) {
        debug_assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);
        let bucket = size.trailing_zeros() as usize;
        let epoch = self.current_epoch.load(Ordering::Relaxed) % NUM_EPOCHS;
        unsafe { self.epochs[epoch].by_size[bucket].push(chunk.cast::<ChunkNode>()) };
    }

    /// Advance the epoch by one tick, decommitting whatever sits in the
    /// bucket that is about to be reused. Called by the background timer;
    /// also exposed for embeddings driving decay manually.
    pub fn decay_now(&self) {
        stat_inc!(decay_sweeps);
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let stale = new_epoch % NUM_EPOCHS;
        for bucket in 0..BITS {
            let mut head = self.epochs[stale].by_size[bucket].take_all();
            while !head.is_null() {
                let next = unsafe { (*head).0.load(Ordering::Relaxed) };
                let size = 1usize << bucket;
                unsafe { platform::notify_not_using(head.cast::<u8>(), size) };
                unsafe { self.decommitted.by_size[bucket].push(head) };
                head = next;
            }
        }
    }
}

fn tick() {
    global().decay_now();
}

static GLOBAL: ChunkAllocator = ChunkAllocator::new();

/// Accessor for the process-wide chunk allocator.
#[inline]
pub fn global() -> &'static ChunkAllocator {
    GLOBAL.ensure_decay_timer();
    &GLOBAL
}
