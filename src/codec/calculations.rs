//! Pure calculation functions for texture dimensions.
//!
//! All functions here are pure and testable without any I/O or textures.

/// Block-compression tiles are 4×4 pixels.
pub const BLOCK: u32 = 4;

/// Round to the nearest multiple of 4, never below 4.
pub fn round_to_block(value: f64) -> u32 {
    let blocks = (value / BLOCK as f64).round() as u32;
    blocks.max(1) * BLOCK
}

/// Round down to a multiple of 4, never below 4.
fn floor_to_block(value: u32) -> u32 {
    (value / BLOCK).max(1) * BLOCK
}

/// Calculate output dimensions for a texture shrunk to `target` on its longer edge.
///
/// The longer edge becomes `target` (floored to a block multiple so the result
/// never exceeds the budget), the shorter edge keeps the aspect ratio and is
/// rounded to the nearest block multiple.
///
/// # Examples
/// ```
/// # use texsquash::codec::calculations::calculate_resize_dimensions;
/// // 4096x4096 at 2048 → 2048x2048
/// assert_eq!(calculate_resize_dimensions((4096, 4096), 2048), (2048, 2048));
///
/// // 4096x1024 at 1024 → 1024x256
/// assert_eq!(calculate_resize_dimensions((4096, 1024), 1024), (1024, 256));
/// ```
pub fn calculate_resize_dimensions(original: (u32, u32), target: u32) -> (u32, u32) {
    let (orig_w, orig_h) = original;
    let major = floor_to_block(target);

    if orig_w >= orig_h {
        // Landscape or square
        let ratio = major as f64 / orig_w.max(1) as f64;
        (major, round_to_block(orig_h as f64 * ratio))
    } else {
        // Portrait
        let ratio = major as f64 / orig_h.max(1) as f64;
        (round_to_block(orig_w as f64 * ratio), major)
    }
}

/// Size buckets for the last-resort dimension estimate: `(upper bound in bytes, edge)`.
const SIZE_BUCKETS: &[(u64, u32)] = &[
    (64 * 1024, 256),
    (256 * 1024, 512),
    (1024 * 1024, 1024),
    (4 * 1024 * 1024, 2048),
    (16 * 1024 * 1024, 4096),
];

/// Edge length assumed for anything above the largest bucket.
const LARGEST_ESTIMATE: u32 = 8192;

/// Estimate a square texture edge from its file size.
///
/// Monotonic: a larger file never yields a smaller estimate.
pub fn estimate_edge_from_size(bytes: u64) -> u32 {
    SIZE_BUCKETS
        .iter()
        .find(|(limit, _)| bytes < *limit)
        .map(|(_, edge)| *edge)
        .unwrap_or(LARGEST_ESTIMATE)
}
