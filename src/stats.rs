//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own atomics and
//! spinlocks provide the ordering guarantees for correctness; these counters
//! are purely for monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = coremalloc::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Global allocation stats ----
    /// Total calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to dealloc with a non-null pointer.
    pub dealloc_count: AtomicU64,
    /// Total calls to realloc (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    // ---- Routing breakdown ----
    /// Allocations routed through the small-object (slab) path.
    pub small_alloc_count: AtomicU64,
    /// Allocations routed directly to the chunk allocator (large objects,
    /// or over-aligned requests the slab path can't satisfy).
    pub large_alloc_count: AtomicU64,

    // ---- Local allocator (thread-local fast path) ----
    /// Small allocations served straight from the thread-local free list.
    pub local_free_list_hits: AtomicU64,
    /// Small allocations that missed the free list and refilled from the
    /// bound core allocator.
    pub local_free_list_misses: AtomicU64,
    /// Frees handled locally (same-thread owner), no remote queue involved.
    pub local_dealloc_count: AtomicU64,
    /// Frees posted to another thread's core allocator via the remote queue.
    pub remote_post_count: AtomicU64,
    /// Remote-free batches flushed in one push (one CAS per batch instead
    /// of one per object).
    pub remote_flush_count: AtomicU64,

    // ---- Core allocator ----
    /// Times a core allocator's remote inbox was drained.
    pub remote_drain_count: AtomicU64,
    /// Brand-new slabs minted because no sleeping slab had capacity.
    pub slab_mint_count: AtomicU64,
    /// Slabs reclaimed back to the chunk allocator after their last object
    /// was freed.
    pub slab_reclaim_count: AtomicU64,

    // ---- Chunk allocator / OS ----
    /// Chunk requests served from an epoch bucket or the decommitted list,
    /// without a fresh address-space reservation.
    pub chunk_cache_hits: AtomicU64,
    /// Chunk requests that required a fresh reservation from the platform.
    pub chunk_cache_misses: AtomicU64,
    /// Epoch-decay sweeps that ran (background timer or explicit
    /// `cleanup_unused`).
    pub decay_sweeps: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            small_alloc_count: AtomicU64::new(0),
            large_alloc_count: AtomicU64::new(0),
            local_free_list_hits: AtomicU64::new(0),
            local_free_list_misses: AtomicU64::new(0),
            local_dealloc_count: AtomicU64::new(0),
            remote_post_count: AtomicU64::new(0),
            remote_flush_count: AtomicU64::new(0),
            remote_drain_count: AtomicU64::new(0),
            slab_mint_count: AtomicU64::new(0),
            slab_reclaim_count: AtomicU64::new(0),
            chunk_cache_hits: AtomicU64::new(0),
            chunk_cache_misses: AtomicU64::new(0),
            decay_sweeps: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between
/// loads. For monitoring purposes this is always sufficient.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub small_alloc_count: u64,
    pub large_alloc_count: u64,
    pub local_free_list_hits: u64,
    pub local_free_list_misses: u64,
    pub local_dealloc_count: u64,
    pub remote_post_count: u64,
    pub remote_flush_count: u64,
    pub remote_drain_count: u64,
    pub slab_mint_count: u64,
    pub slab_reclaim_count: u64,
    pub chunk_cache_hits: u64,
    pub chunk_cache_misses: u64,
    pub decay_sweeps: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        small_alloc_count: s.small_alloc_count.load(Ordering::Relaxed),
        large_alloc_count: s.large_alloc_count.load(Ordering::Relaxed),
        local_free_list_hits: s.local_free_list_hits.load(Ordering::Relaxed),
        local_free_list_misses: s.local_free_list_misses.load(Ordering::Relaxed),
        local_dealloc_count: s.local_dealloc_count.load(Ordering::Relaxed),
        remote_post_count: s.remote_post_count.load(Ordering::Relaxed),
        remote_flush_count: s.remote_flush_count.load(Ordering::Relaxed),
        remote_drain_count: s.remote_drain_count.load(Ordering::Relaxed),
        slab_mint_count: s.slab_mint_count.load(Ordering::Relaxed),
        slab_reclaim_count: s.slab_reclaim_count.load(Ordering::Relaxed),
        chunk_cache_hits: s.chunk_cache_hits.load(Ordering::Relaxed),
        chunk_cache_misses: s.chunk_cache_misses.load(Ordering::Relaxed),
        decay_sweeps: s.decay_sweeps.load(Ordering::Relaxed),
    }
}
