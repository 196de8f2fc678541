use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    min_chunk_bits: Option<u32>,
    min_alloc_bits: Option<u32>,
    intermediate_bits: Option<u32>,
    max_small_sizeclass_bits: Option<u32>,
    min_objects_per_slab: Option<usize>,
    num_epochs: Option<usize>,
    decay_period_ms: Option<u64>,
    initial_reservation_bits: Option<u32>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    min_chunk_bits: u32,
    min_alloc_bits: u32,
    intermediate_bits: u32,
    max_small_sizeclass_bits: u32,
    min_objects_per_slab: usize,
    num_epochs: usize,
    decay_period_ms: u64,
    initial_reservation_bits: u32,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let min_chunk_bits = cfg.min_chunk_bits.unwrap_or(14);
    let min_alloc_bits = cfg.min_alloc_bits.unwrap_or(4);
    let intermediate_bits = cfg.intermediate_bits.unwrap_or(2);
    let max_small_sizeclass_bits = cfg.max_small_sizeclass_bits.unwrap_or(17);
    let min_objects_per_slab = cfg.min_objects_per_slab.unwrap_or(16);
    let num_epochs = cfg.num_epochs.unwrap_or(4);
    let decay_period_ms = cfg.decay_period_ms.unwrap_or(500);
    let initial_reservation_bits = cfg.initial_reservation_bits.unwrap_or(26);

    assert!(min_chunk_bits >= 12, "min_chunk_bits must be >= 12");
    assert!(min_alloc_bits >= 3, "min_alloc_bits must be >= 3");
    assert!(
        intermediate_bits <= 6,
        "intermediate_bits too large ({intermediate_bits}), table would explode"
    );
    assert!(
        max_small_sizeclass_bits > min_alloc_bits,
        "max_small_sizeclass_bits must exceed min_alloc_bits"
    );
    assert!(
        max_small_sizeclass_bits <= min_chunk_bits + 8,
        "max_small_sizeclass_bits unreasonably far above min_chunk_bits"
    );
    assert!(min_objects_per_slab > 0, "min_objects_per_slab must be > 0");
    assert!(
        num_epochs.is_power_of_two() && num_epochs >= 2,
        "num_epochs ({num_epochs}) must be a power of two >= 2"
    );
    assert!(decay_period_ms > 0, "decay_period_ms must be > 0");
    assert!(
        initial_reservation_bits > min_chunk_bits,
        "initial_reservation_bits must exceed min_chunk_bits"
    );

    ResolvedConfig {
        min_chunk_bits,
        min_alloc_bits,
        intermediate_bits,
        max_small_sizeclass_bits,
        min_objects_per_slab,
        num_epochs,
        decay_period_ms,
        initial_reservation_bits,
    }
}

/// One entry of the generated size-class table.
struct ClassDef {
    /// Usable object size for this class (the rounded-up request size).
    rsize: usize,
    /// Slab size for this class: smallest power of two holding at least
    /// `min_objects_per_slab` objects, never smaller than one chunk.
    slab_size: usize,
    /// Number of whole objects that fit in `slab_size` bytes.
    capacity: usize,
    /// Reciprocal constant for fast division by `rsize` (see size_class.rs).
    reciprocal: u64,
    /// Shift paired with `reciprocal`.
    reciprocal_shift: u32,
}

/// Smallest power of two >= n.
fn next_pow2(n: usize) -> usize {
    if n <= 1 { 1 } else { 1usize << (usize::BITS - (n - 1).leading_zeros()) }
}

/// Compute (reciprocal, shift) such that for all 0 <= x < 2^32,
/// x / rsize == (x * reciprocal) >> shift, using the standard
/// "magic number" division-by-constant technique restricted to a
/// shift of 64 so the multiply fits in a u128 intermediate.
fn compute_reciprocal(rsize: usize) -> (u64, u32) {
    let shift = 64u32;
    let reciprocal = ((1u128 << shift) + (rsize as u128) - 1) / (rsize as u128);
    (reciprocal as u64, shift)
}

/// Build the list of (exponent, intermediate-index) size classes the way
/// the spec's reciprocal-division scheme lays them out: for every exponent
/// e >= min_alloc_bits, 2^intermediate_bits classes evenly spaced between
/// 2^e and 2^(e+1).
fn build_classes(cfg: &ResolvedConfig) -> Vec<ClassDef> {
    let mut sizes = Vec::new();
    let step_count = 1usize << cfg.intermediate_bits;

    // The smallest class is exactly 2^min_alloc_bits.
    sizes.push(1usize << cfg.min_alloc_bits);

    let mut exp = cfg.min_alloc_bits;
    while exp < cfg.max_small_sizeclass_bits {
        let base = 1usize << exp;
        let next = 1usize << (exp + 1);
        let step = (next - base) / step_count;
        for i in 1..step_count {
            let size = base + step * i;
            // Round to the allocator's natural alignment (8 bytes, or the
            // size itself if sub-8).
            let align = 8usize.min(size.max(1));
            let size = size.div_ceil(align) * align;
            if size > base && size < next {
                sizes.push(size);
            }
        }
        sizes.push(next);
        exp += 1;
    }

    sizes.sort_unstable();
    sizes.dedup();
    sizes.retain(|&s| s <= (1usize << cfg.max_small_sizeclass_bits));

    sizes
        .into_iter()
        .map(|rsize| {
            let min_bytes = rsize * cfg.min_objects_per_slab;
            let slab_size = next_pow2(min_bytes.max(1usize << cfg.min_chunk_bits));
            let capacity = slab_size / rsize;
            let (reciprocal, reciprocal_shift) = compute_reciprocal(rsize);
            ClassDef {
                rsize,
                slab_size,
                capacity,
                reciprocal,
                reciprocal_shift,
            }
        })
        .collect()
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let decay_window_ms = (cfg.num_epochs as u64 - 1) * cfg.decay_period_ms;
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const MIN_CHUNK_BITS: u32 = {};\n\
         pub const MIN_CHUNK_SIZE: usize = 1 << MIN_CHUNK_BITS;\n\
         pub const MIN_ALLOC_BITS: u32 = {};\n\
         pub const INTERMEDIATE_BITS: u32 = {};\n\
         pub const MAX_SMALL_SIZECLASS_BITS: u32 = {};\n\
         pub const MAX_SMALL_SIZE: usize = 1 << MAX_SMALL_SIZECLASS_BITS;\n\
         pub const MIN_OBJECTS_PER_SLAB: usize = {};\n\
         pub const NUM_EPOCHS: usize = {};\n\
         pub const DECAY_PERIOD_MS: u64 = {};\n\
         pub const DECAY_WINDOW_MS: u64 = {};\n\
         pub const INITIAL_RESERVATION_BITS: u32 = {};\n",
        cfg.min_chunk_bits,
        cfg.min_alloc_bits,
        cfg.intermediate_bits,
        cfg.max_small_sizeclass_bits,
        cfg.min_objects_per_slab,
        cfg.num_epochs,
        cfg.decay_period_ms,
        decay_window_ms,
        cfg.initial_reservation_bits,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ rsize: 0, slab_size: 0, capacity: 0, reciprocal: 0, reciprocal_shift: 0 }}, // sentinel (class 0 means \"not ours\")\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ rsize: {}, slab_size: {}, capacity: {}, reciprocal: {}, reciprocal_shift: {} }},\n",
            d.rsize, d.slab_size, d.capacity, d.reciprocal, d.reciprocal_shift
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/coremalloc.toml", manifest_dir)
}

fn main() {
    println!("cargo:rerun-if-env-changed=COREMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("COREMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = build_classes(&resolved);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
