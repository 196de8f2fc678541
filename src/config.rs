//! Compile-time tunables, generated from `coremalloc.toml` by `build.rs`.
//!
//! See the crate root `coremalloc.toml` for the human-editable source and
//! `build.rs` for the generation logic. Nothing in this module is computed
//! at runtime; it is a thin `include!` wrapper so the rest of the crate can
//! write `crate::config::MIN_CHUNK_SIZE` the way it would a hand-written
//! constant.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Assumed OS page size, used only to round pagemap leaf-node allocations.
/// Not a generated tunable: every target this allocator supports pages at
/// 4 KiB, and rounding up to a larger real page size (if wrong) is still
/// correct, just slightly wasteful.
pub const PAGE_SIZE: usize = 4096;

/// Whether slab free lists are built via Sattolo's algorithm (hardened
/// against heap-spray attacks relying on predictable allocation order) or
/// a plain linear chain (cheaper). A single runtime policy knob rather
/// than a `cfg_if!`-selected code path, since both share the same
/// `FreeListBuilder` plumbing in `slab.rs` and only the construction order
/// differs.
pub const HARDENED_DEFAULT: bool = cfg!(feature = "hardening");
