//! The size-class table and its reciprocal-division arithmetic.
//!
//! Size classes are generated at build time from `coremalloc.toml` (see
//! `build.rs`): for every power-of-two exponent from `MIN_ALLOC_BITS` up to
//! `MAX_SMALL_SIZECLASS_BITS`, `2^INTERMEDIATE_BITS` classes are laid out
//! evenly between that exponent and the next. Class `0` is a sentinel
//! meaning "not a small-object size class" (used by the pagemap to mark
//! free or large-object chunks).
//!
//! Division and modulus by an `rsize` that is only known at runtime would
//! normally cost a hardware divide on every free-list offset check. Instead
//! each class stores a precomputed reciprocal: `x / rsize == (x as u128 *
//! reciprocal) >> reciprocal_shift` for every `x` that fits in a `usize`.

use crate::config::MIN_CHUNK_SIZE;

/// One row of the compile-time-generated size-class table.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct SizeClassInfo {
    /// Usable object size in bytes. `0` for the sentinel class.
    pub rsize: usize,
    /// Size, in bytes, of a slab backing this class. Always a multiple of
    /// `MIN_CHUNK_SIZE` and a power of two.
    pub slab_size: usize,
    /// Number of whole objects that fit in one slab of this class.
    pub capacity: usize,
    /// Reciprocal constant for fast division by `rsize`.
    pub reciprocal: u64,
    /// Shift amount paired with `reciprocal`.
    pub reciprocal_shift: u32,
}

impl SizeClassInfo {
    /// Deterministic threshold at which a sleeping slab is woken for reuse:
    /// once this many objects have been returned to it, the slab is handed
    /// back to the owning core allocator's active list.
    ///
    /// `min(capacity/16 + 2, 32)`: small enough that a mostly-freed slab
    /// doesn't sit idle indefinitely, large enough that a slab isn't woken
    /// after a single stray free.
    #[inline]
    pub const fn wake_threshold(&self) -> u16 {
        let t = self.capacity / 16 + 2;
        (if t < 32 { t } else { 32 }) as u16
    }
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Number of rows in [`SIZE_CLASSES`], including the class-0 sentinel.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Largest request size still served by the small-object (slab) path.
pub const MAX_SMALL_SIZE: usize = crate::config::MAX_SMALL_SIZE;

/// Map a requested allocation size to the smallest size class whose
/// `rsize` is `>= size`. `size` must be `> 0` and `<= MAX_SMALL_SIZE`;
/// callers route anything larger to the large-object path before calling
/// this function.
#[inline]
pub fn size_to_sizeclass(size: usize) -> u8 {
    debug_assert!(size > 0 && size <= MAX_SMALL_SIZE);
    // SIZE_CLASSES[1..] is sorted ascending by rsize; binary search for the
    // first entry whose rsize is >= size.
    let idx = SIZE_CLASSES[1..].partition_point(|c| c.rsize < size);
    (idx + 1) as u8
}

/// Usable object size for `cls`. `cls` must be a valid, non-sentinel class.
#[inline]
pub fn sizeclass_to_size(cls: u8) -> usize {
    SIZE_CLASSES[cls as usize].rsize
}

/// Slab size backing `cls`.
#[inline]
pub fn sizeclass_to_slab_size(cls: u8) -> usize {
    SIZE_CLASSES[cls as usize].slab_size
}

/// Number of objects that fit in one slab of `cls`.
#[inline]
pub fn sizeclass_to_slab_object_count(cls: u8) -> usize {
    SIZE_CLASSES[cls as usize].capacity
}

/// See [`SizeClassInfo::wake_threshold`].
#[inline]
pub fn threshold_for_waking_slab(cls: u8) -> u16 {
    SIZE_CLASSES[cls as usize].wake_threshold()
}

/// Fast `offset / rsize` for class `cls`, via the precomputed reciprocal.
#[inline]
pub fn div_by_sizeclass(cls: u8, offset: usize) -> usize {
    let info = &SIZE_CLASSES[cls as usize];
    (((offset as u128) * (info.reciprocal as u128)) >> info.reciprocal_shift) as usize
}

/// Fast `offset % rsize` for class `cls`.
#[inline]
pub fn mod_by_sizeclass(cls: u8, offset: usize) -> usize {
    let info = &SIZE_CLASSES[cls as usize];
    offset - div_by_sizeclass(cls, offset) * info.rsize
}

/// Round `offset` down to the start of the object it falls within, for a
/// slab of class `cls` whose base is implicitly `0` (i.e. `offset` is
/// already slab-relative).
#[inline]
pub fn round_by_sizeclass(cls: u8, offset: usize) -> usize {
    offset - mod_by_sizeclass(cls, offset)
}

/// True iff `offset` lands exactly on an object boundary for class `cls`.
#[inline]
pub fn is_multiple_of_sizeclass(cls: u8, offset: usize) -> bool {
    mod_by_sizeclass(cls, offset) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_well_formed() {
        assert_eq!(SIZE_CLASSES[0].rsize, 0);
        for w in SIZE_CLASSES[1..].windows(2) {
            assert!(w[1].rsize > w[0].rsize, "classes must strictly increase");
        }
        for c in &SIZE_CLASSES[1..] {
            assert!(c.slab_size >= MIN_CHUNK_SIZE);
            assert!(c.slab_size.is_power_of_two());
            assert!(c.capacity > 0);
            assert!(c.capacity * c.rsize <= c.slab_size);
        }
    }

    #[test]
    fn round_trip_for_every_class() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = sizeclass_to_size(cls as u8);
            assert_eq!(size_to_sizeclass(size) as usize, cls);
        }
    }

    #[test]
    fn size_to_sizeclass_rounds_up() {
        let cls = size_to_sizeclass(1);
        assert!(sizeclass_to_size(cls) >= 1);
        // One below the largest class's size should round up to that class,
        // never overflow past it.
        let last = NUM_SIZE_CLASSES - 1;
        let last_size = sizeclass_to_size(last as u8);
        assert_eq!(size_to_sizeclass(last_size) as usize, last);
    }

    #[test]
    fn reciprocal_division_matches_hardware_divide() {
        for cls in 1..NUM_SIZE_CLASSES {
            let rsize = sizeclass_to_size(cls as u8);
            let slab_size = sizeclass_to_slab_size(cls as u8);
            let mut offset = 0usize;
            while offset < slab_size {
                assert_eq!(div_by_sizeclass(cls as u8, offset), offset / rsize);
                assert_eq!(mod_by_sizeclass(cls as u8, offset), offset % rsize);
                offset += rsize;
            }
        }
    }

    #[test]
    fn round_by_sizeclass_is_idempotent_on_object_starts() {
        for cls in 1..NUM_SIZE_CLASSES {
            let rsize = sizeclass_to_size(cls as u8);
            let capacity = sizeclass_to_slab_object_count(cls as u8);
            for k in 0..capacity.min(64) {
                let start = k * rsize;
                assert_eq!(round_by_sizeclass(cls as u8, start), start);
                assert!(is_multiple_of_sizeclass(cls as u8, start));
                if rsize > 1 {
                    assert!(!is_multiple_of_sizeclass(cls as u8, start + 1));
                }
            }
        }
    }

    #[test]
    fn wake_threshold_is_bounded() {
        for cls in 1..NUM_SIZE_CLASSES {
            let t = threshold_for_waking_slab(cls as u8);
            assert!((2..=32).contains(&t));
        }
    }
}
