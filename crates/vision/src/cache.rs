//! Single-slot screenshot cache shared between the streamer (writer) and the
//! agent loop (reader).

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use image::{imageops::FilterType, Rgba};

use webpilot_core::types::Frame;
use webpilot_core::{Error, Result};

const MARKER_RADIUS: i32 = 6;

/// Holds the most recent frame. Replaced atomically on each capture; readers
/// get an `Arc` clone and never block the writer for long.
pub struct FrameCache {
    slot: RwLock<Option<Arc<Frame>>>,
    /// Pending interaction marker in full-image coordinates, drawn onto the
    /// scaled copy of the next published frame.
    marker: Mutex<Option<(u32, u32)>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            marker: Mutex::new(None),
        }
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn publish(&self, frame: Frame) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(frame));
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Set where the last interaction happened so the UI can see it. `None`
    /// clears the marker.
    pub fn set_marker(&self, marker: Option<(u32, u32)>) {
        *self.marker.lock().unwrap_or_else(|e| e.into_inner()) = marker;
    }

    pub fn marker(&self) -> Option<(u32, u32)> {
        *self.marker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode a full PNG capture into a [`Frame`]: keep the original bytes,
    /// produce a scaled copy for streaming, and draw the current marker onto
    /// that copy only.
    pub fn build_frame(&self, full_png: Vec<u8>, scaled_width: u32) -> Result<Frame> {
        let full = image::load_from_memory(&full_png)
            .map_err(|e| Error::Other(format!("failed to decode capture: {}", e)))?;
        let (width, height) = (full.width(), full.height());
        let marker = self.marker();

        let mut scaled = if width > scaled_width && scaled_width > 0 {
            let scaled_height =
                ((height as u64 * scaled_width as u64) / width as u64).max(1) as u32;
            full.resize_exact(scaled_width, scaled_height, FilterType::Triangle)
                .to_rgba8()
        } else {
            full.to_rgba8()
        };

        if let Some((mx, my)) = marker {
            let sx = (mx as u64 * scaled.width() as u64 / width.max(1) as u64) as i32;
            let sy = (my as u64 * scaled.height() as u64 / height.max(1) as u64) as i32;
            draw_marker(&mut scaled, sx, sy);
        }

        let mut scaled_png = Vec::new();
        scaled
            .write_to(&mut std::io::Cursor::new(&mut scaled_png), image::ImageFormat::Png)
            .map_err(|e| Error::Other(format!("failed to encode scaled frame: {}", e)))?;

        Ok(Frame {
            full_png,
            scaled_png,
            width,
            height,
            captured_at: Utc::now(),
            marker,
        })
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

fn draw_marker(img: &mut image::RgbaImage, cx: i32, cy: i32) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for dy in -MARKER_RADIUS..=MARKER_RADIUS {
        for dx in -MARKER_RADIUS..=MARKER_RADIUS {
            let d2 = dx * dx + dy * dy;
            // Ring, not a filled disc, so the clicked pixel stays visible
            if d2 > MARKER_RADIUS * MARKER_RADIUS || d2 < (MARKER_RADIUS - 2) * (MARKER_RADIUS - 2)
            {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && x < w && y >= 0 && y < h {
                img.put_pixel(x as u32, y as u32, Rgba([255, 0, 0, 255]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn solid_png(width: u32, height: u32, color: Rgba<u8>) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, color);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_publish_replaces_atomically() {
        let cache = FrameCache::new();
        assert!(cache.latest().is_none());

        let frame = cache
            .build_frame(solid_png(100, 80, Rgba([255, 255, 255, 255])), 50)
            .unwrap();
        cache.publish(frame);
        let first = cache.latest().unwrap();
        assert_eq!(first.width, 100);
        assert_eq!(first.height, 80);

        let frame = cache
            .build_frame(solid_png(200, 100, Rgba([0, 0, 0, 255])), 50)
            .unwrap();
        cache.publish(frame);
        let second = cache.latest().unwrap();
        assert_eq!(second.width, 200);
        // The reader's earlier Arc is still intact
        assert_eq!(first.width, 100);
    }

    #[test]
    fn test_scaled_copy_dimensions() {
        let cache = FrameCache::new();
        let frame = cache
            .build_frame(solid_png(100, 60, Rgba([10, 10, 10, 255])), 50)
            .unwrap();
        let scaled = image::load_from_memory(&frame.scaled_png).unwrap();
        assert_eq!(scaled.width(), 50);
        assert_eq!(scaled.height(), 30);

        // No upscaling: narrower captures keep their size
        let frame = cache
            .build_frame(solid_png(40, 40, Rgba([10, 10, 10, 255])), 50)
            .unwrap();
        let scaled = image::load_from_memory(&frame.scaled_png).unwrap();
        assert_eq!(scaled.width(), 40);
    }

    #[test]
    fn test_marker_drawn_on_scaled_copy_only() {
        let cache = FrameCache::new();
        cache.set_marker(Some((50, 30)));
        let white = solid_png(100, 60, Rgba([255, 255, 255, 255]));
        let frame = cache.build_frame(white.clone(), 100).unwrap();
        assert_eq!(frame.marker, Some((50, 30)));

        // Full copy untouched
        assert_eq!(frame.full_png, white);

        // Scaled copy carries red marker pixels
        let scaled = image::load_from_memory(&frame.scaled_png).unwrap().to_rgba8();
        let has_red = scaled.pixels().any(|p| p.0 == [255, 0, 0, 255]);
        assert!(has_red);

        cache.set_marker(None);
        let frame = cache.build_frame(white, 100).unwrap();
        let scaled = image::load_from_memory(&frame.scaled_png).unwrap().to_rgba8();
        assert!(!scaled.pixels().any(|p| p.0 == [255, 0, 0, 255]));
    }

    #[test]
    fn test_build_frame_rejects_garbage() {
        let cache = FrameCache::new();
        assert!(cache.build_frame(b"garbage".to_vec(), 50).is_err());
    }
}
