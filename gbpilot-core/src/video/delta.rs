//! Frame-difference motion detection.
//!
//! Frames are shrunk to a small `size × size` greyscale thumbnail and
//! compared pixel-by-pixel; the score is the mean absolute difference
//! normalized to `0.0 – 1.0`. Bit-identical frames short-circuit to an
//! exact `0.0`.

use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::capture::types::CaptureFrame;

/// Default thumbnail edge length.
pub const DEFAULT_DIFF_SIZE: u32 = 32;

/// Default score above which two frames "differ significantly".
pub const DEFAULT_DIFF_THRESHOLD: f64 = 0.1;

/// Downsample and greyscale a frame for comparison.
pub fn thumbnail(frame: &CaptureFrame, size: u32) -> GrayImage {
    let size = size.max(1);
    let small = imageops::resize(frame.image.as_ref(), size, size, FilterType::Triangle);
    imageops::grayscale(&small)
}

/// Mean absolute difference of two thumbnails, in `[0, 1]`.
pub fn thumbnail_difference(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return 1.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    total as f64 / (a.as_raw().len() as f64 * 255.0)
}

/// Normalized difference between two frames.
pub fn frame_difference(a: &CaptureFrame, b: &CaptureFrame, size: u32) -> f64 {
    if a.same_pixels(b) {
        return 0.0;
    }
    thumbnail_difference(&thumbnail(a, size), &thumbnail(b, size))
}

/// `true` when the difference exceeds `threshold`.
pub fn differs_significantly(a: &CaptureFrame, b: &CaptureFrame, threshold: f64, size: u32) -> bool {
    frame_difference(a, b, size) > threshold
}

// ── MotionDetector ───────────────────────────────────────────────

/// Stateful detector that remembers the previous thumbnail so a frame
/// sequence is downsampled only once per frame.
pub struct MotionDetector {
    previous: Option<(GrayImage, blake3::Hash)>,
    size: u32,
}

impl MotionDetector {
    pub fn new(size: u32) -> Self {
        Self {
            previous: None,
            size: size.max(1),
        }
    }

    /// Forget the previous frame; the next observation scores `0.0`.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Score `frame` against the previously observed frame.
    pub fn observe(&mut self, frame: &CaptureFrame) -> f64 {
        let digest = frame.digest();
        let thumb = thumbnail(frame, self.size);
        let score = match &self.previous {
            Some((_, prev_digest)) if *prev_digest == digest => 0.0,
            Some((prev, _)) => thumbnail_difference(prev, &thumb),
            None => 0.0,
        };
        self.previous = Some((thumb, digest));
        score
    }
}

// ── Key frames ───────────────────────────────────────────────────

/// Pick key-frame indices.
///
/// The first frame is always kept; a frame is kept when it differs
/// significantly from the last kept key frame; the last frame is always
/// kept. The result is capped at `max` (first and last survive the cap;
/// the middle is thinned evenly).
pub fn select_key_frames(frames: &[CaptureFrame], threshold: f64, size: u32, max: usize) -> Vec<usize> {
    if frames.is_empty() || max == 0 {
        return Vec::new();
    }

    let mut kept = vec![0];
    let mut last_thumb = thumbnail(&frames[0], size);
    let mut last_index = 0;

    for (i, frame) in frames.iter().enumerate().skip(1) {
        if i == frames.len() - 1 {
            break;
        }
        if frame.same_pixels(&frames[last_index]) {
            continue;
        }
        let thumb = thumbnail(frame, size);
        if thumbnail_difference(&last_thumb, &thumb) > threshold {
            kept.push(i);
            last_thumb = thumb;
            last_index = i;
        }
    }
    if frames.len() > 1 {
        kept.push(frames.len() - 1);
    }

    cap_evenly(kept, max)
}

/// Keep the first and last entries and an even spread of the middle.
fn cap_evenly(kept: Vec<usize>, max: usize) -> Vec<usize> {
    if kept.len() <= max {
        return kept;
    }
    if max == 1 {
        return vec![kept[0]];
    }
    let last = kept.len() - 1;
    (0..max)
        .map(|i| kept[i * last / (max - 1)])
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(v: u8) -> CaptureFrame {
        CaptureFrame::new(RgbaImage::from_pixel(64, 64, Rgba([v, v, v, 255])), 0)
    }

    #[test]
    fn identical_frames_score_exactly_zero() {
        let a = solid(120);
        let b = solid(120);
        assert_eq!(frame_difference(&a, &b, DEFAULT_DIFF_SIZE), 0.0);
        for threshold in [1e-9, 0.01, 0.1, 0.9] {
            assert!(!differs_significantly(&a, &b, threshold, DEFAULT_DIFF_SIZE));
        }
    }

    #[test]
    fn black_and_white_score_one() {
        let score = frame_difference(&solid(0), &solid(255), DEFAULT_DIFF_SIZE);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn small_change_stays_below_threshold() {
        let score = frame_difference(&solid(100), &solid(110), DEFAULT_DIFF_SIZE);
        assert!(score < DEFAULT_DIFF_THRESHOLD, "score = {score}");
        assert!(score > 0.0);
    }

    #[test]
    fn detector_tracks_previous() {
        let mut det = MotionDetector::new(16);
        assert_eq!(det.observe(&solid(0)), 0.0);
        assert_eq!(det.observe(&solid(0)), 0.0);
        assert!(det.observe(&solid(255)) > 0.9);
        det.reset();
        assert_eq!(det.observe(&solid(255)), 0.0);
    }

    #[test]
    fn key_frames_keep_first_changes_and_last() {
        let frames = vec![solid(0), solid(0), solid(200), solid(200), solid(5), solid(5)];
        let keys = select_key_frames(&frames, DEFAULT_DIFF_THRESHOLD, 16, 10);
        assert_eq!(keys, vec![0, 2, 4, 5]);
    }

    #[test]
    fn key_frames_single_and_empty() {
        assert!(select_key_frames(&[], 0.1, 16, 5).is_empty());
        assert_eq!(select_key_frames(&[solid(1)], 0.1, 16, 5), vec![0]);
    }

    #[test]
    fn key_frames_are_capped() {
        let frames: Vec<_> = (0..20).map(|i| solid(if i % 2 == 0 { 0 } else { 255 })).collect();
        let keys = select_key_frames(&frames, DEFAULT_DIFF_THRESHOLD, 16, 4);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], 0);
        assert_eq!(*keys.last().unwrap(), 19);
    }
}
