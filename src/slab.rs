//! Slab / Metaslab: a chunk-sized region holding objects of one size
//! class, and its external header.
//!
//! A slab itself is just raw chunk memory sliced into `rsize`-sized
//! objects; all bookkeeping lives in the external [`Metaslab`], allocated
//! separately (by the chunk allocator's meta-data allocator) so that a
//! corrupted or adversarial write into the slab can never reach the
//! allocator's own state.
//!
//! Free-list construction comes in two flavours selected by
//! [`crate::config`]'s hardening policy knob (§9a: a runtime flag, not a
//! separate code path dispatched by `cfg_if!`, since both share the same
//! [`FreeListBuilder`] plumbing):
//! - linear: a straightforward chain from object 0 to object `capacity-1`.
//! - randomised: Sattolo's algorithm, outside-in variant, so that objects
//!   never need zeroing before they are linked (each object's first word
//!   is written at most once, with either a "next" pointer or left as
//!   whatever the OS handed back — never read before being written).

use crate::size_class::{self, threshold_for_waking_slab};
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// A small, cheap local entropy source. Not cryptographic: only used to
/// pick insertion points for the free-list shuffle, where the only
/// requirement is "hard for a heap-spraying attacker to predict without
/// also being able to observe the allocator's internal counters".
pub struct Entropy(u64);

impl Entropy {
    /// Seed from a process-wide counter mixed with the caller's address,
    /// so two slabs created back-to-back on the same thread still get
    /// independent streams.
    pub fn new(mix: usize) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);
        let c = COUNTER.fetch_add(0x9E3779B97F4A7C15, Ordering::Relaxed);
        Self(splitmix64(c ^ (mix as u64)))
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.0 = splitmix64(self.0);
        self.0
    }

    /// Uniform (modulo-biased, which is fine here) value in `0..bound`.
    #[inline]
    pub fn next_below(&mut self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }
        (self.next_u64() % bound as u64) as usize
    }
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[inline]
unsafe fn next_ptr(obj: *mut u8) -> *mut u8 {
    unsafe { *(obj as *mut *mut u8) }
}

#[inline]
unsafe fn set_next_ptr(obj: *mut u8, next: *mut u8) {
    unsafe { *(obj as *mut *mut u8) = next };
}

#[inline]
fn object_at(base: *mut u8, rsize: usize, idx: usize) -> *mut u8 {
    unsafe { base.add(idx * rsize) }
}

/// Build a simple increasing-address chain over `capacity` objects. Used
/// in the non-hardened build.
fn build_linear_list(base: *mut u8, rsize: usize, capacity: usize) -> *mut u8 {
    debug_assert!(capacity > 0);
    for i in 0..capacity - 1 {
        unsafe { set_next_ptr(object_at(base, rsize, i), object_at(base, rsize, i + 1)) };
    }
    unsafe { set_next_ptr(object_at(base, rsize, capacity - 1), ptr::null_mut()) };
    base
}

/// Build a uniformly-random single-cycle permutation over `capacity`
/// objects (Sattolo's algorithm, outside-in variant), then cut the cycle
/// at a random point to produce the final null-terminated free list.
///
/// Each object's first word is written exactly once before being read, so
/// no zero-initialisation of the slab is required ahead of time.
fn build_randomized_list(
    base: *mut u8,
    rsize: usize,
    capacity: usize,
    entropy: &mut Entropy,
) -> *mut u8 {
    debug_assert!(capacity > 0);
    let obj = |i: usize| object_at(base, rsize, i);

    // Single-element cycle: object 0 points to itself.
    unsafe { set_next_ptr(obj(0), obj(0)) };

    // Insert each subsequent object right after a uniformly-random
    // already-placed object in the cycle built so far. This is the
    // standard "random insertion" construction of a uniformly random
    // single-cycle permutation (equivalent in distribution to Sattolo's
    // in-place shuffle), and it only ever touches object `k`'s memory once
    // it is inserted.
    for k in 1..capacity {
        let j = entropy.next_below(k + 1);
        let j_ptr = obj(j);
        let k_ptr = obj(k);
        unsafe {
            let j_next = next_ptr(j_ptr);
            set_next_ptr(k_ptr, j_next);
            set_next_ptr(j_ptr, k_ptr);
        }
    }

    // Cut the cycle at a random start point and walk it once, turning the
    // cyclic "next" chain into a terminated list.
    let start = entropy.next_below(capacity);
    let start_ptr = obj(start);
    let mut cur = start_ptr;
    for _ in 0..capacity - 1 {
        cur = unsafe { next_ptr(cur) };
    }
    unsafe { set_next_ptr(cur, ptr::null_mut()) };
    start_ptr
}

/// Two-ended free-list handle: open (mutable, being constructed or
/// accumulated into) while the slab is asleep collecting returns, closed
/// (handed over wholesale, now empty) once the owning core allocator
/// steals it.
#[derive(Default)]
struct FreeListBuilder {
    head: *mut u8,
    /// Number of nodes currently linked from `head`. Lets a hand-out of the
    /// whole list tell the caller how many objects it is taking back.
    len: u16,
}

impl FreeListBuilder {
    const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Push one object onto the open end.
    #[inline]
    fn push(&mut self, obj: *mut u8) {
        unsafe { set_next_ptr(obj, self.head) };
        self.head = obj;
        self.len += 1;
    }

    /// Take the whole list, leaving the builder empty ("closed"). Returns
    /// the list head along with the number of objects it carries.
    #[inline]
    fn close(&mut self) -> (*mut u8, u16) {
        let h = self.head;
        let n = self.len;
        self.head = ptr::null_mut();
        self.len = 0;
        (h, n)
    }
}

/// The external per-slab header. Lives in backend meta-data memory, never
/// inside the slab it describes.
pub struct Metaslab {
    list: FreeListBuilder,
    /// Counts down to zero as frees accumulate; see module docs and
    /// `return_object`.
    needed: u16,
    /// Objects currently allocated (not yet returned) from this slab.
    /// Reaching zero means the slab is fully reclaimable.
    allocated: u16,
    sizeclass: u8,
    sleeping: bool,
    /// Base address of the slab's object storage. Retained here (rather
    /// than derived from the object pointer) for provenance-strict
    /// targets, where an object pointer's provenance may be bounded to the
    /// object itself and cannot be walked back to the chunk header.
    chunk: *mut u8,
    /// Intrusive link used by the owning core allocator to thread this
    /// Metaslab onto its per-size-class sleeping list. Untouched by
    /// anything else.
    next: *mut Metaslab,
}

// A Metaslab is only ever touched by the single core allocator that
// currently owns it; it is moved across threads only as part of moving
// ownership of the whole core allocator (e.g. pool acquire/release), never
// concurrently accessed.
unsafe impl Send for Metaslab {}

impl Metaslab {
    pub const fn uninit() -> Self {
        Self {
            list: FreeListBuilder::empty(),
            needed: 0,
            allocated: 0,
            sizeclass: 0,
            sleeping: true,
            chunk: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    /// `initialise(sizeclass)`: set the sleeping state, `needed` to the
    /// wake threshold. Called once when a Metaslab is (re)bound to a slab.
    pub fn initialise(&mut self, sizeclass: u8, chunk: *mut u8) {
        self.list = FreeListBuilder::empty();
        self.needed = threshold_for_waking_slab(sizeclass);
        self.allocated = 0;
        self.sizeclass = sizeclass;
        self.sleeping = true;
        self.chunk = chunk;
        self.next = ptr::null_mut();
    }

    /// Next Metaslab in the owning core allocator's sleeping list.
    pub fn next(&self) -> *mut Metaslab {
        self.next
    }

    pub fn set_next(&mut self, next: *mut Metaslab) {
        self.next = next;
    }

    pub fn sizeclass(&self) -> u8 {
        self.sizeclass
    }

    pub fn chunk(&self) -> *mut u8 {
        self.chunk
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn is_unused(&self) -> bool {
        self.allocated == 0
    }

    /// First use of a brand-new, never-touched slab: build the free list
    /// across every object in the slab, close it into the caller's hands,
    /// and hand back one object immediately plus the rest of the list.
    ///
    /// `hardened` selects Sattolo's-algorithm construction vs. the plain
    /// linear chain.
    pub fn populate_fresh(
        &mut self,
        slab_base: *mut u8,
        hardened: bool,
        entropy: &mut Entropy,
    ) -> (*mut u8, *mut u8) {
        let capacity = size_class::sizeclass_to_slab_object_count(self.sizeclass);
        let head = if hardened {
            build_randomized_list(
                slab_base,
                size_class::sizeclass_to_size(self.sizeclass),
                capacity,
                entropy,
            )
        } else {
            build_linear_list(
                slab_base,
                size_class::sizeclass_to_size(self.sizeclass),
                capacity,
            )
        };
        self.sleeping = true;
        self.allocated = capacity as u16;
        self.needed = threshold_for_waking_slab(self.sizeclass);
        let rest = unsafe { next_ptr(head) };
        (head, rest)
    }

    /// `alloc_from`: the core allocator calls this when it wants to
    /// (re)activate a slab that already has accumulated returns sitting in
    /// its builder (i.e. it was woken, not freshly carved). Closes the
    /// builder, puts the slab back to sleep, and hands back one object
    /// plus the remaining list. Returns `None` if the builder is empty
    /// (nothing to steal).
    pub fn alloc_from(&mut self) -> Option<(*mut u8, *mut u8)> {
        if self.list.is_empty() {
            return None;
        }
        let (head, count) = self.list.close();
        // These objects were subtracted from `allocated` as they came back
        // in via `return_object`; handing them back out makes them live
        // again.
        self.allocated = self.allocated.saturating_add(count);
        self.sleeping = true;
        self.needed = threshold_for_waking_slab(self.sizeclass);
        let rest = unsafe { next_ptr(head) };
        Some((head, rest))
    }

    /// Return one freed object to this slab. Returns `true` iff this call
    /// is the one that drove `needed` from one to zero — the caller must
    /// then check [`Self::is_unused`] to decide whether to reclaim the
    /// chunk (fully unused) or wake the slab back into circulation (some
    /// objects remain allocated). Once `needed` has reached zero, further
    /// returns report `false`: the slab has already been signalled and
    /// sits on the core allocator's sleeping list until it is next woken.
    pub fn return_object(&mut self, obj: *mut u8) -> bool {
        self.list.push(obj);
        self.allocated = self.allocated.saturating_sub(1);
        if self.needed == 0 {
            return false;
        }
        self.needed -= 1;
        self.needed == 0
    }

    /// Transition a slept-then-signalled slab back to active circulation,
    /// resetting its wake counter for the next round.
    pub fn wake(&mut self) {
        self.sleeping = false;
        self.needed = threshold_for_waking_slab(self.sizeclass);
    }

    /// True iff `addr` (known to fall within this slab) lands exactly on
    /// an object boundary. Used by dealloc for corruption detection.
    pub fn is_start_of_object(&self, addr: *mut u8) -> bool {
        let offset = addr as usize - self.chunk as usize;
        size_class::is_multiple_of_sizeclass(self.sizeclass, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Scratch {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Scratch {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn collect_list(mut head: *mut u8) -> std::vec::Vec<*mut u8> {
        let mut v = std::vec::Vec::new();
        while !head.is_null() {
            v.push(head);
            head = unsafe { next_ptr(head) };
        }
        v
    }

    #[test]
    fn linear_list_visits_every_object_once_in_order() {
        let rsize = 32;
        let capacity = 16;
        let scratch = Scratch::new(rsize * capacity);
        let head = build_linear_list(scratch.ptr, rsize, capacity);
        let visited = collect_list(head);
        assert_eq!(visited.len(), capacity);
        for (i, &p) in visited.iter().enumerate() {
            assert_eq!(p, object_at(scratch.ptr, rsize, i));
        }
    }

    #[test]
    fn randomized_list_visits_every_object_exactly_once() {
        let rsize = 32;
        let capacity = 64;
        let scratch = Scratch::new(rsize * capacity);
        let mut entropy = Entropy::new(0x1234);
        let head = build_randomized_list(scratch.ptr, rsize, capacity, &mut entropy);
        let mut visited = collect_list(head);
        assert_eq!(visited.len(), capacity);
        visited.sort_unstable();
        let mut expected: std::vec::Vec<*mut u8> =
            (0..capacity).map(|i| object_at(scratch.ptr, rsize, i)).collect();
        expected.sort_unstable();
        assert_eq!(visited, expected);
    }

    #[test]
    fn randomized_list_is_not_monotonic() {
        // Statistical smoke test (spec §8 scenario 4): the randomised
        // construction should rarely, if ever, produce the identity
        // ordering across many slabs.
        let rsize = 16;
        let capacity = 64;
        let mut adjacent_matches = 0usize;
        let mut total = 0usize;
        for seed in 0..200u64 {
            let scratch = Scratch::new(rsize * capacity);
            let mut entropy = Entropy::new(seed as usize);
            let head = build_randomized_list(scratch.ptr, rsize, capacity, &mut entropy);
            let visited = collect_list(head);
            for w in visited.windows(2) {
                total += 1;
                if (w[1] as usize).wrapping_sub(w[0] as usize) == rsize {
                    adjacent_matches += 1;
                }
            }
        }
        let rate = adjacent_matches as f64 / total as f64;
        assert!(rate < 0.5, "adjacency rate too high: {rate}");
    }

    #[test]
    fn metaslab_populate_then_return_to_unused() {
        let rsize = size_class::sizeclass_to_size(1);
        let capacity = size_class::sizeclass_to_slab_object_count(1);
        let scratch = Scratch::new(rsize * capacity);
        let mut meta = Metaslab::uninit();
        meta.initialise(1, scratch.ptr);
        let mut entropy = Entropy::new(7);

        let (first, mut rest) = meta.populate_fresh(scratch.ptr, false, &mut entropy);
        assert!(!first.is_null());
        assert!(meta.is_sleeping());
        assert_eq!(meta.allocated, capacity as u16);

        // Drain the rest of the batch (as if a local allocator consumed it).
        let mut taken = 1usize;
        while !rest.is_null() {
            let next = unsafe { next_ptr(rest) };
            rest = next;
            taken += 1;
        }
        assert_eq!(taken, capacity);

        // Now return every object; the slab must become unused exactly
        // once the last object comes back.
        let all = [first];
        let _ = all; // first already counted
        let mut objects: std::vec::Vec<*mut u8> = (0..capacity)
            .map(|i| object_at(scratch.ptr, rsize, i))
            .collect();
        // populate_fresh's head was objects[0] in the non-hardened path.
        objects.retain(|&p| p != first);
        let mut woke_or_reclaimed = false;
        let signalled = meta.return_object(first);
        woke_or_reclaimed |= signalled;
        for obj in objects {
            if meta.return_object(obj) {
                woke_or_reclaimed = true;
            }
        }
        assert!(woke_or_reclaimed);
        assert!(meta.is_unused());
    }

    #[test]
    fn alloc_from_restores_allocated_count() {
        let sizeclass = 1u8;
        let rsize = size_class::sizeclass_to_size(sizeclass);
        let capacity = size_class::sizeclass_to_slab_object_count(sizeclass);
        let scratch = Scratch::new(rsize * capacity);
        let mut meta = Metaslab::uninit();
        meta.initialise(sizeclass, scratch.ptr);
        let mut entropy = Entropy::new(11);

        let (first, rest) = meta.populate_fresh(scratch.ptr, false, &mut entropy);
        assert_eq!(meta.allocated, capacity as u16);

        let mut objects: std::vec::Vec<*mut u8> = std::vec::Vec::with_capacity(capacity);
        objects.push(first);
        objects.extend(collect_list(rest));
        assert_eq!(objects.len(), capacity);

        // Return every object, driving the slab fully unused and asleep.
        for &obj in &objects {
            meta.return_object(obj);
        }
        assert!(meta.is_unused());
        assert_eq!(meta.allocated, 0);

        // Wake it and steal the accumulated free list back out, as
        // `CoreAllocator::refill` does on a sleeping-slab hit. Every
        // object handed back out this way is live again, so `allocated`
        // must reflect the full count, not stay at zero.
        meta.wake();
        let (reused_first, reused_rest) = meta.alloc_from().expect("builder had objects");
        assert!(!reused_first.is_null());
        let reused = 1 + collect_list(reused_rest).len();
        assert_eq!(reused, capacity);
        assert_eq!(meta.allocated, capacity as u16);
        assert!(!meta.is_unused());
    }

    #[test]
    fn return_object_signals_exactly_once_per_wake_cycle() {
        let sizeclass = 1u8;
        let rsize = size_class::sizeclass_to_size(sizeclass);
        let capacity = size_class::sizeclass_to_slab_object_count(sizeclass);
        let scratch = Scratch::new(rsize * capacity);
        let mut meta = Metaslab::uninit();
        meta.initialise(sizeclass, scratch.ptr);
        let mut entropy = Entropy::new(13);

        let (first, rest) = meta.populate_fresh(scratch.ptr, false, &mut entropy);
        let mut objects: std::vec::Vec<*mut u8> = std::vec::Vec::with_capacity(capacity);
        objects.push(first);
        objects.extend(collect_list(rest));

        // Free every object. `needed` will hit zero partway through and
        // stay there; only that single transition may report `true` —
        // a stuck-at-zero counter must not re-signal on every later free.
        let signalled_count = objects
            .iter()
            .filter(|&&obj| meta.return_object(obj))
            .count();
        assert_eq!(signalled_count, 1);
    }

    #[test]
    fn is_start_of_object_detects_misaligned_addresses() {
        let rsize = size_class::sizeclass_to_size(2);
        let capacity = size_class::sizeclass_to_slab_object_count(2).min(8);
        let scratch = Scratch::new(rsize * capacity.max(1));
        let mut meta = Metaslab::uninit();
        meta.initialise(2, scratch.ptr);
        assert!(meta.is_start_of_object(scratch.ptr));
        if rsize > 1 {
            assert!(!meta.is_start_of_object(unsafe { scratch.ptr.add(1) }));
        }
    }
}
