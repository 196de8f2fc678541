//! Flat map from chunk-aligned address to per-chunk metadata ([`MetaEntry`]).
//!
//! Indexed by `addr >> MIN_CHUNK_BITS`. Implemented as a 2-level radix tree:
//! a statically-allocated root of pointers to lazily-allocated leaves, each
//! leaf holding the actual entries. This gives sparse, lazy behaviour for
//! free (the common case for a general virtual-memory target) without a
//! separate "fixed-range" flavour: a single-region embedding just never
//! touches more than one leaf.
//!
//! A [`MetaEntry`] packs three independently-owned fields: a pointer to the
//! owning [`crate::slab::Metaslab`], a pointer to the owning core allocator
//! (type-erased here to avoid a module cycle — callers cast), and a
//! size-class byte. The pagemap stores these as plain opaque pointers rather
//! than bit-packing them into one word (see `DESIGN.md`): the spec's
//! low-bit-packing trick is exactly the kind of "dunder pointer trick" the
//! redesign notes ask to replace with explicit fields, and a chunk's entry
//! is mutated by exactly one owner at a time, so there is no need to update
//! all three fields atomically as a unit.
//!
//! The same entry shape is reused by the address-space manager to thread a
//! free-list "next" pointer through chunk-granularity blocks: a
//! [`MetaEntry`] with `remote == null` and `sizeclass == 0` is the
//! universal "not a live small/large allocation" tag, and its `metaslab`
//! slot doubles as that next-pointer (see `address_space.rs`).

use crate::config::MIN_CHUNK_BITS;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Sentinel stored in [`MetaEntry::remote`] for chunks backing a single
/// large (>= slab-size) allocation. Never dereferenced — only compared.
pub fn fake_large_remote() -> *mut u8 {
    // A non-null, well-aligned-looking value that can never collide with a
    // real core-allocator pointer (those come from the backend's meta-data
    // allocator and are chunk-of-a-chunk aligned, i.e. far better aligned
    // than 1).
    1usize as *mut u8
}

/// Number of address bits this pagemap indexes. Userspace virtual address
/// spaces on the platforms this allocator targets (x86-64, AArch64) are
/// canonically 48 bits; going wider would only enlarge the root for no
/// practical benefit.
const ADDRESS_BITS: u32 = 48;

const CHUNK_INDEX_BITS: u32 = ADDRESS_BITS - MIN_CHUNK_BITS;
const ROOT_BITS: u32 = if CHUNK_INDEX_BITS > 18 {
    18
} else {
    CHUNK_INDEX_BITS
};
const LEAF_BITS: u32 = CHUNK_INDEX_BITS - ROOT_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

/// A single chunk's metadata, as stored directly in a pagemap leaf.
#[repr(C)]
struct RawEntry {
    metaslab: AtomicPtr<u8>,
    remote: AtomicPtr<u8>,
    sizeclass: AtomicU8,
}

impl RawEntry {
    const fn empty() -> Self {
        Self {
            metaslab: AtomicPtr::new(ptr::null_mut()),
            remote: AtomicPtr::new(ptr::null_mut()),
            sizeclass: AtomicU8::new(0),
        }
    }
}

#[repr(C)]
struct Leaf {
    entries: [RawEntry; LEAF_LEN],
}

/// An owned, `Copy`able view of one chunk's pagemap entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaEntry {
    /// Type-erased `*mut Metaslab`, or the address-space manager's
    /// "next free block" link when this entry is untagged.
    pub metaslab: *mut u8,
    /// Type-erased `*mut CoreAllocator`; null if this chunk is not
    /// currently owned by any core allocator; [`fake_large_remote`] if it
    /// backs a single large allocation.
    pub remote: *mut u8,
    /// Size class for small allocations; `log2(size)` for large
    /// allocations (tagged via `remote == fake_large_remote()`); `0`
    /// otherwise (free, or address-space bookkeeping).
    pub sizeclass: u8,
}

impl MetaEntry {
    /// The universal "not a live allocation" tag: free chunk, or a chunk
    /// still owned by the address-space manager's bucket bookkeeping.
    pub const EMPTY: Self = Self {
        metaslab: ptr::null_mut(),
        remote: ptr::null_mut(),
        sizeclass: 0,
    };

    /// Build the free-list "next" link entry the address-space manager
    /// threads through chunk-granularity blocks (see `address_space.rs`).
    #[inline]
    pub fn free_link(next: *mut u8) -> Self {
        Self {
            metaslab: next,
            remote: ptr::null_mut(),
            sizeclass: 0,
        }
    }

    #[inline]
    pub fn is_unowned(&self) -> bool {
        self.remote.is_null()
    }

    #[inline]
    pub fn is_fake_large(&self) -> bool {
        self.remote == fake_large_remote()
    }
}

/// Flat, lazily-backed address -> [`MetaEntry`] map.
pub struct PageMap {
    root: [AtomicPtr<Leaf>; ROOT_LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: a null AtomicPtr<T> has the all-zero bit pattern.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, Leaf),
        }
    }

    #[inline]
    fn split(addr: usize) -> (usize, usize) {
        let chunk_idx = addr >> MIN_CHUNK_BITS;
        let root_idx = chunk_idx >> LEAF_BITS;
        let leaf_idx = chunk_idx & (LEAF_LEN - 1);
        (root_idx, leaf_idx)
    }

    /// Read the entry covering `addr`. Always safe: an address whose leaf
    /// has never been materialised (out of range, or simply untouched)
    /// reads back as [`MetaEntry::EMPTY`] rather than panicking. This is
    /// what the spec calls the `may_be_unmapped = true` mode; every caller
    /// in this crate only ever reads addresses it has either allocated
    /// itself (in which case the leaf is already materialised) or received
    /// from untrusted code being domesticated, so the stricter
    /// "may_be_unmapped = false" trapping mode has no customer and is
    /// dropped (see DESIGN.md).
    #[inline]
    pub fn get(&self, addr: usize) -> MetaEntry {
        let (root_idx, leaf_idx) = Self::split(addr);
        if root_idx >= ROOT_LEN {
            return MetaEntry::EMPTY;
        }
        let leaf = self.root[root_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            return MetaEntry::EMPTY;
        }
        let entry = unsafe { &(*leaf).entries[leaf_idx] };
        MetaEntry {
            metaslab: entry.metaslab.load(Ordering::Acquire),
            remote: entry.remote.load(Ordering::Acquire),
            sizeclass: entry.sizeclass.load(Ordering::Acquire),
        }
    }

    /// Write `entry` to every chunk-aligned index covering `[addr, addr+len)`.
    pub fn set(&self, addr: usize, len: usize, entry: MetaEntry) {
        debug_assert!(len > 0);
        let chunk_size = 1usize << MIN_CHUNK_BITS;
        let mut a = addr;
        let end = addr + len;
        while a < end {
            self.set_one(a, entry);
            a += chunk_size;
        }
    }

    /// Write `entry` to the single chunk covering `addr`, materialising the
    /// backing leaf node on demand.
    pub fn set_one(&self, addr: usize, entry: MetaEntry) {
        let (root_idx, leaf_idx) = Self::split(addr);
        assert!(root_idx < ROOT_LEN, "address out of pagemap range");

        let mut leaf = self.root[root_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = self.alloc_leaf();
            match self.root[root_idx].compare_exchange(
                ptr::null_mut(),
                leaf,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(existing) => {
                    // Another thread raced us; drop ours, use theirs. We
                    // never free leaves (they live for the process), so
                    // "drop" here just means never publishing it — a small
                    // one-time leak of the loser's leaf, acceptable for a
                    // bootstrap race that happens at most a handful of
                    // times per root slot over a process's lifetime.
                    leaf = existing;
                }
            }
        }

        let raw = unsafe { &(*leaf).entries[leaf_idx] };
        raw.metaslab.store(entry.metaslab, Ordering::Release);
        raw.sizeclass.store(entry.sizeclass, Ordering::Release);
        raw.remote.store(entry.remote, Ordering::Release);
    }

    /// Ensure the leaves covering `[addr, addr+len)` exist, without writing
    /// any entries. Called by the backend whenever new virtual memory comes
    /// under management, so that later `set_one` calls on the hot path
    /// never race to allocate a leaf.
    pub fn register_range(&self, addr: usize, len: usize) {
        let chunk_size = 1usize << MIN_CHUNK_BITS;
        let leaf_span = chunk_size << LEAF_BITS;
        let mut a = addr - (addr % leaf_span);
        let end = addr + len;
        while a < end {
            let (root_idx, _) = Self::split(a);
            if root_idx < ROOT_LEN && self.root[root_idx].load(Ordering::Acquire).is_null() {
                let leaf = self.alloc_leaf();
                if self.root[root_idx]
                    .compare_exchange(
                        ptr::null_mut(),
                        leaf,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // Lost the race; our leaf is simply never published.
                }
            }
            a += leaf_span;
        }
    }

    fn alloc_leaf(&self) -> *mut Leaf {
        let size = core::mem::size_of::<Leaf>();
        let alloc_size = size
            .next_power_of_two()
            .max(crate::config::MIN_CHUNK_SIZE);
        // Leaves are allocated straight from the PAL, not through the
        // backend/core-allocator machinery the pagemap itself supports:
        // this breaks the bootstrap cycle (the backend needs a pagemap
        // before it can hand out the first chunk).
        let raw = unsafe { crate::platform::reserve_aligned(alloc_size, true) };
        if raw.is_null() {
            crate::platform::error("pagemap: failed to allocate leaf node");
        }
        raw.cast::<Leaf>()
    }
}

/// The single process-wide pagemap.
static GLOBAL: PageMap = PageMap::new();

/// Accessor for the process-wide pagemap.
#[inline]
pub fn global() -> &'static PageMap {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CHUNK_SIZE;

    #[test]
    fn empty_reads_are_empty() {
        let map = PageMap::new();
        assert_eq!(map.get(0), MetaEntry::EMPTY);
        assert_eq!(map.get(0xdead_beef_0000), MetaEntry::EMPTY);
    }

    #[test]
    fn set_then_get_round_trips() {
        let map = PageMap::new();
        let addr = 4 * MIN_CHUNK_SIZE;
        let entry = MetaEntry {
            metaslab: 0x1000 as *mut u8,
            remote: 0x2000 as *mut u8,
            sizeclass: 5,
        };
        map.set_one(addr, entry);
        assert_eq!(map.get(addr), entry);
        // Neighbouring chunk is untouched.
        assert_eq!(map.get(addr + MIN_CHUNK_SIZE), MetaEntry::EMPTY);
    }

    #[test]
    fn set_range_covers_every_chunk() {
        let map = PageMap::new();
        let base = 16 * MIN_CHUNK_SIZE;
        let entry = MetaEntry {
            metaslab: 0x3000 as *mut u8,
            remote: 0x4000 as *mut u8,
            sizeclass: 0,
        };
        map.set(base, MIN_CHUNK_SIZE * 4, entry);
        for i in 0..4 {
            assert_eq!(map.get(base + i * MIN_CHUNK_SIZE), entry);
        }
        assert_eq!(map.get(base + 4 * MIN_CHUNK_SIZE), MetaEntry::EMPTY);
    }

    #[test]
    fn fake_large_remote_is_distinguishable() {
        let entry = MetaEntry {
            metaslab: ptr::null_mut(),
            remote: fake_large_remote(),
            sizeclass: 20,
        };
        assert!(entry.is_fake_large());
        assert!(!entry.is_unowned());
        assert!(MetaEntry::EMPTY.is_unowned());
    }

    #[test]
    fn free_link_round_trips() {
        let map = PageMap::new();
        let addr = 8 * MIN_CHUNK_SIZE;
        let next = 0xabcd as *mut u8;
        map.set_one(addr, MetaEntry::free_link(next));
        let got = map.get(addr);
        assert!(got.is_unowned());
        assert_eq!(got.metaslab, next);
    }

    #[test]
    fn high_address_exercises_full_split() {
        let map = PageMap::new();
        let addr = (1usize << 45) + 3 * MIN_CHUNK_SIZE;
        let entry = MetaEntry {
            metaslab: 0x42 as *mut u8,
            remote: 0x99 as *mut u8,
            sizeclass: 1,
        };
        map.set_one(addr, entry);
        assert_eq!(map.get(addr), entry);
    }
}
