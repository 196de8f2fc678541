//! Power-of-two address-space manager: a buddy-like splitter over raw
//! regions obtained from the platform. Everything above this module asks
//! it for chunk- (or sub-chunk-, for meta-data) sized power-of-two blocks;
//! it never returns memory to the OS once reserved (§ Non-goals).
//!
//! One free list per alignment-bits bucket (`heads[b]` holds the base of
//! the first free block of size `2^b`, or `0` for empty). The design note
//! on ad-hoc intrusive lists asks for an explicit sum type rather than a
//! single "next lives wherever it happens to fit" trick: here that sum
//! type is simply *where* the bucket's link is stored, dispatched once per
//! operation on `bucket >= MIN_CHUNK_BITS`:
//! - at or above chunk granularity, the link is the pagemap's `free_link`
//!   entry for the block's base address (the pagemap already indexes at
//!   this granularity, so no extra memory is touched);
//! - below chunk granularity (sub-chunk blocks used for meta-data
//!   allocation), the link lives in the block's own first word, which
//!   requires the block be committed before it is written.
//!
//! All bucket-array manipulation happens under a single spinlock, held
//! only long enough to read/link/write one block; the potentially slow
//! `commit_block` call that backs a fresh top-level reservation runs
//! outside it.

use crate::config::MIN_CHUNK_BITS;
use crate::pagemap::{self, MetaEntry};
use crate::platform;
use crate::sync::SpinMutex;

const BITS: usize = usize::BITS as usize;

struct Buckets {
    heads: [usize; BITS],
}

/// The address-space manager. One instance is process-wide (see
/// [`global`]).
pub struct AddressSpaceManager {
    state: SpinMutex<Buckets>,
}

impl Default for AddressSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn floor_log2(n: usize) -> u32 {
    debug_assert!(n > 0);
    usize::BITS - 1 - n.leading_zeros()
}

impl AddressSpaceManager {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(Buckets { heads: [0; BITS] }),
        }
    }

    #[inline]
    fn link_read(bucket: usize, base: usize) -> usize {
        if bucket >= MIN_CHUNK_BITS as usize {
            pagemap::global().get(base).metaslab as usize
        } else {
            unsafe { platform::notify_using(base as *mut u8, 1usize << bucket) };
            unsafe { *(base as *const usize) }
        }
    }

    #[inline]
    fn link_write(bucket: usize, base: usize, next: usize) {
        if bucket >= MIN_CHUNK_BITS as usize {
            pagemap::global().set_one(base, MetaEntry::free_link(next as *mut u8));
        } else {
            unsafe { platform::notify_using(base as *mut u8, 1usize << bucket) };
            unsafe { *(base as *mut usize) = next };
        }
    }

    fn push_block(&self, bucket: usize, base: usize) {
        let mut heads = self.state.lock();
        let old_head = heads.heads[bucket];
        Self::link_write(bucket, base, old_head);
        heads.heads[bucket] = base;
    }

    fn pop_block(&self, bucket: usize) -> Option<usize> {
        let mut heads = self.state.lock();
        let head = heads.heads[bucket];
        if head == 0 {
            return None;
        }
        let next = Self::link_read(bucket, head);
        heads.heads[bucket] = next;
        Some(head)
    }

    /// Decompose `[base, base+length)` into maximally-aligned power-of-two
    /// blocks and push each onto its bucket.
    pub fn add_range(&self, base: usize, length: usize) {
        let mut b = base;
        let mut remaining = length;
        while remaining > 0 {
            let align_bits = if b == 0 {
                floor_log2(remaining)
            } else {
                b.trailing_zeros().min(floor_log2(remaining))
            };
            let block_size = 1usize << align_bits;
            self.push_block(align_bits as usize, b);
            b += block_size;
            remaining -= block_size;
        }
    }

    /// Reserve a block of exactly `size` bytes (`size` must be a power of
    /// two). Returns `None` (out of address space) only if the platform
    /// itself refuses a fresh top-level reservation.
    pub fn reserve(&self, size: usize) -> Option<usize> {
        debug_assert!(size.is_power_of_two());
        let bucket = size.trailing_zeros() as usize;

        if let Some(base) = self.pop_block(bucket) {
            return Some(base);
        }

        for b in (bucket + 1)..BITS {
            if let Some(base) = self.pop_block(b) {
                let mut cur_base = base;
                let mut cur_bucket = b;
                while cur_bucket > bucket {
                    cur_bucket -= 1;
                    let half = 1usize << cur_bucket;
                    self.push_block(cur_bucket, cur_base + half);
                    // The lower half stays ours, to split further (or
                    // return) on the next iteration.
                    let _ = cur_base;
                }
                return Some(cur_base);
            }
        }

        self.reserve_fresh(size)
    }

    /// Round `size` up to the next power of two, reserve that, and return
    /// the leftover tail (the bytes between `size` and the rounded-up
    /// block) to the manager for smaller consumers.
    pub fn reserve_with_left_over(&self, size: usize) -> Option<usize> {
        let rounded = size.next_power_of_two().max(1);
        let base = self.reserve(rounded)?;
        if rounded > size {
            self.add_range(base + size, rounded - size);
        }
        Some(base)
    }

    /// Page-align `[base, base+size)` outward and commit it via the PAL.
    /// Never called while the bucket spinlock is held.
    pub fn commit_block(&self, base: usize, size: usize) {
        let page = crate::config::PAGE_SIZE;
        let start = base & !(page - 1);
        let end = (base + size).div_ceil(page) * page;
        unsafe { platform::notify_using(start as *mut u8, end - start) };
    }

    /// Ask the platform directly for a fresh top-level reservation when
    /// nothing cached satisfies `size`. Registers the new range with both
    /// the pagemap (so later `get`/`set_one` calls never race to allocate
    /// a leaf) and this manager's buckets (for whatever is left over).
    fn reserve_fresh(&self, size: usize) -> Option<usize> {
        let grab = size.max(1usize << crate::config::INITIAL_RESERVATION_BITS);
        let ptr = unsafe { platform::reserve_aligned(grab, false) };
        if ptr.is_null() {
            return None;
        }
        let base = ptr as usize;
        pagemap::global().register_range(base, grab);
        if grab > size {
            self.add_range(base + size, grab - size);
        }
        Some(base)
    }
}

static GLOBAL: AddressSpaceManager = AddressSpaceManager::new();

/// Accessor for the process-wide address-space manager.
#[inline]
pub fn global() -> &'static AddressSpaceManager {
    &GLOBAL
}
