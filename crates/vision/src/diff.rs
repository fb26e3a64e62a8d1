//! Pixel-level change detection between two screenshot frames.

use image::GenericImageView;
use tracing::debug;

use webpilot_core::types::ChangeVerdict;

/// Compare two PNG-encoded frames and judge whether the page visibly changed.
///
/// A pixel counts as different when any RGBA channel differs by more than
/// `aa_tolerance`, which absorbs anti-aliasing and sub-pixel rendering noise.
/// The verdict flips to `changed` when the differing-pixel percentage exceeds
/// `threshold_percent`.
///
/// Dimension mismatch is a verdict (a resize or device-pixel-ratio shift is a
/// real change), not an error. Undecodable bytes degrade to an unchanged
/// verdict carrying an `error` so callers can treat the result as unknown
/// instead of aborting the run.
pub fn compare_frames(
    before_png: &[u8],
    after_png: &[u8],
    threshold_percent: f64,
    aa_tolerance: u8,
) -> ChangeVerdict {
    let before = match image::load_from_memory(before_png) {
        Ok(img) => img,
        Err(e) => return ChangeVerdict::degraded(format!("failed to decode before frame: {}", e)),
    };
    let after = match image::load_from_memory(after_png) {
        Ok(img) => img,
        Err(e) => return ChangeVerdict::degraded(format!("failed to decode after frame: {}", e)),
    };

    if before.dimensions() != after.dimensions() {
        debug!(
            before = ?before.dimensions(),
            after = ?after.dimensions(),
            "Frame dimensions differ, treating as full change"
        );
        return ChangeVerdict::dimension_mismatch();
    }

    let before = before.to_rgba8();
    let after = after.to_rgba8();
    let (width, height) = before.dimensions();
    let total_pixels = width as u64 * height as u64;
    if total_pixels == 0 {
        return ChangeVerdict::unchanged(0);
    }

    let tolerance = aa_tolerance as i16;
    let mut diff_count = 0u64;
    for (p1, p2) in before.pixels().zip(after.pixels()) {
        let differs = p1
            .0
            .iter()
            .zip(p2.0.iter())
            .any(|(a, b)| (*a as i16 - *b as i16).abs() > tolerance);
        if differs {
            diff_count += 1;
        }
    }

    let percent_diff = diff_count as f64 / total_pixels as f64 * 100.0;
    ChangeVerdict {
        changed: percent_diff > threshold_percent,
        percent_diff,
        pixels_diff: diff_count as i64,
        total_pixels,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn solid_png(width: u32, height: u32, color: Rgba<u8>) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, color);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_identical_frames() {
        let png = solid_png(50, 50, Rgba([200, 10, 10, 255]));
        let verdict = compare_frames(&png, &png, 0.5, 10);
        assert!(!verdict.changed);
        assert_eq!(verdict.percent_diff, 0.0);
        assert_eq!(verdict.pixels_diff, 0);
        assert_eq!(verdict.total_pixels, 2500);
        assert!(verdict.error.is_none());
    }

    #[test]
    fn test_fully_different_frames() {
        let red = solid_png(50, 50, Rgba([255, 0, 0, 255]));
        let blue = solid_png(50, 50, Rgba([0, 0, 255, 255]));
        let verdict = compare_frames(&red, &blue, 0.5, 10);
        assert!(verdict.changed);
        assert_eq!(verdict.percent_diff, 100.0);
        assert_eq!(verdict.pixels_diff, 2500);
    }

    #[test]
    fn test_dimension_mismatch_is_a_change() {
        let small = solid_png(50, 50, Rgba([255, 0, 0, 255]));
        let large = solid_png(60, 50, Rgba([255, 0, 0, 255]));
        let verdict = compare_frames(&small, &large, 0.5, 10);
        assert!(verdict.changed);
        assert_eq!(verdict.percent_diff, 100.0);
        assert_eq!(verdict.pixels_diff, -1);
        assert!(verdict.error.is_none());
    }

    #[test]
    fn test_corrupt_bytes_degrade() {
        let png = solid_png(10, 10, Rgba([0, 0, 0, 255]));
        let verdict = compare_frames(b"not a png", &png, 0.5, 10);
        assert!(!verdict.changed);
        assert!(verdict.error.is_some());

        let verdict = compare_frames(&png, b"not a png", 0.5, 10);
        assert!(!verdict.changed);
        assert!(verdict.error.is_some());
    }

    #[test]
    fn test_anti_aliasing_tolerance_absorbs_small_deltas() {
        let a = solid_png(20, 20, Rgba([100, 100, 100, 255]));
        let b = solid_png(20, 20, Rgba([108, 104, 95, 255]));
        // All channel deltas within the tolerance of 10
        let verdict = compare_frames(&a, &b, 0.5, 10);
        assert!(!verdict.changed);
        assert_eq!(verdict.pixels_diff, 0);

        // With zero tolerance the same pair counts as changed
        let strict = compare_frames(&a, &b, 0.5, 0);
        assert!(strict.changed);
    }

    #[test]
    fn test_threshold_gates_the_verdict() {
        let base = ImageBuffer::from_pixel(100, 100, Rgba([255u8, 255, 255, 255]));
        let mut modified = base.clone();
        // Flip 30 pixels of 10_000 → 0.3%
        for x in 0..30 {
            modified.put_pixel(x, 0, Rgba([0, 0, 0, 255]));
        }
        let mut a = Vec::new();
        base.write_to(&mut std::io::Cursor::new(&mut a), image::ImageFormat::Png)
            .unwrap();
        let mut b = Vec::new();
        modified
            .write_to(&mut std::io::Cursor::new(&mut b), image::ImageFormat::Png)
            .unwrap();

        let relaxed = compare_frames(&a, &b, 0.5, 10);
        assert!(!relaxed.changed);
        assert_eq!(relaxed.pixels_diff, 30);

        // Text-entry threshold catches the same subtle delta
        let sensitive = compare_frames(&a, &b, 0.1, 10);
        assert!(sensitive.changed);
    }
}
