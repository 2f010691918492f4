//! Animated GIF assembly for sealed segments.
//!
//! Frames are subsampled by an even stride toward the target playback
//! rate, and every output frame gets the same delay:
//!
//! ```text
//! delay_ms = clamp(total_duration_ms / frame_count, 42, 500)
//! ```
//!
//! The clamp can make playback run shorter or longer than the segment
//! really lasted. Divergence beyond half a second is logged and left as is.

use std::time::Duration;

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, Frame};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::types::VideoSegment;
use crate::error::PilotError;

/// 24 fps ceiling.
pub const MIN_FRAME_DELAY_MS: u32 = 42;
/// 2 fps floor.
pub const MAX_FRAME_DELAY_MS: u32 = 500;

const DIVERGENCE_WARN: Duration = Duration::from_millis(500);

/// GIF assembly parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GifConfig {
    /// Target playback rate before delay clamping.
    pub target_fps: f64,
    /// Hard cap on frames in one clip.
    pub max_frames: usize,
    /// Downscale wider frames to this width; `0` keeps the source size.
    pub max_width: u32,
    /// Encoder speed, 1 (best) to 30 (fastest).
    pub speed: i32,
}

impl Default for GifConfig {
    fn default() -> Self {
        Self {
            target_fps: 24.0,
            max_frames: 96,
            max_width: 480,
            speed: 10,
        }
    }
}

/// An encoded clip plus the numbers that went into it.
#[derive(Debug, Clone)]
pub struct GifClip {
    pub bytes: Vec<u8>,
    pub frame_count: usize,
    pub frame_delay: Duration,
    /// `frame_delay × frame_count`.
    pub playback: Duration,
    /// Real duration of the source segment.
    pub source_duration: Duration,
}

impl GifClip {
    /// Absolute difference between playback and real time.
    pub fn divergence(&self) -> Duration {
        self.playback.abs_diff(self.source_duration)
    }
}

/// Indices of the frames to encode: an even spread that always includes
/// the first and last frame.
pub fn subsample_indices(frame_count: usize, duration: Duration, config: &GifConfig) -> Vec<usize> {
    if frame_count == 0 {
        return Vec::new();
    }
    let wanted = (duration.as_secs_f64() * config.target_fps).ceil() as usize;
    let k = wanted.max(2).min(config.max_frames.max(2)).min(frame_count);
    if k <= 1 {
        return vec![0];
    }
    (0..k).map(|i| i * (frame_count - 1) / (k - 1)).collect()
}

/// Per-frame delay for `frame_count` frames spread over `duration`.
pub fn frame_delay_ms(duration: Duration, frame_count: usize) -> u32 {
    if frame_count == 0 {
        return MIN_FRAME_DELAY_MS;
    }
    let raw = duration.as_millis() / frame_count as u128;
    (raw.min(u32::MAX as u128) as u32).clamp(MIN_FRAME_DELAY_MS, MAX_FRAME_DELAY_MS)
}

/// Encode `segment` as a looping GIF. Needs at least two frames.
pub fn build_gif(segment: &VideoSegment, config: &GifConfig) -> Result<GifClip, PilotError> {
    if segment.len() < 2 {
        return Err(PilotError::EmptySegment);
    }

    let source_duration = segment.duration();
    let indices = subsample_indices(segment.len(), source_duration, config);
    let delay_ms = frame_delay_ms(source_duration, indices.len());

    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut bytes, config.speed.clamp(1, 30));
        encoder.set_repeat(Repeat::Infinite)?;
        for &i in &indices {
            let frame = &segment.frames()[i];
            let image = if config.max_width > 0 && frame.width() > config.max_width {
                let height = (frame.height() as u64 * config.max_width as u64 / frame.width() as u64)
                    .max(1) as u32;
                imageops::resize(frame.image.as_ref(), config.max_width, height, FilterType::Triangle)
            } else {
                frame.image.as_ref().clone()
            };
            encoder.encode_frame(Frame::from_parts(
                image,
                0,
                0,
                Delay::from_numer_denom_ms(delay_ms, 1),
            ))?;
        }
    }

    let frame_delay = Duration::from_millis(delay_ms as u64);
    let clip = GifClip {
        bytes,
        frame_count: indices.len(),
        frame_delay,
        playback: frame_delay * indices.len() as u32,
        source_duration,
    };

    if clip.divergence() > DIVERGENCE_WARN {
        warn!(
            playback_ms = clip.playback.as_millis() as u64,
            actual_ms = source_duration.as_millis() as u64,
            "gif playback diverges from segment duration"
        );
    }
    debug!(
        frames = clip.frame_count,
        delay_ms,
        bytes = clip.bytes.len(),
        "gif assembled"
    );
    Ok(clip)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::CaptureFrame;
    use image::{Rgba, RgbaImage};
    use std::time::{Instant, SystemTime};

    fn segment(count: usize, span: Duration) -> VideoSegment {
        let frames = (0..count)
            .map(|i| {
                let v = (i * 20 % 256) as u8;
                CaptureFrame::new(RgbaImage::from_pixel(8, 8, Rgba([v, v, v, 255])), i as u64)
            })
            .collect();
        let start = Instant::now();
        VideoSegment::seal(frames, SystemTime::now(), start, start + span)
    }

    #[test]
    fn delay_is_clamped() {
        assert_eq!(frame_delay_ms(Duration::from_secs(1), 100), MIN_FRAME_DELAY_MS);
        assert_eq!(frame_delay_ms(Duration::from_secs(10), 2), MAX_FRAME_DELAY_MS);
        assert_eq!(frame_delay_ms(Duration::from_secs(1), 10), 100);
        assert_eq!(frame_delay_ms(Duration::ZERO, 5), MIN_FRAME_DELAY_MS);
    }

    #[test]
    fn subsample_keeps_endpoints() {
        let cfg = GifConfig::default();
        let idx = subsample_indices(60, Duration::from_secs(1), &cfg);
        assert_eq!(idx.len(), 24);
        assert_eq!(idx[0], 0);
        assert_eq!(*idx.last().unwrap(), 59);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn subsample_never_exceeds_source() {
        let cfg = GifConfig::default();
        let idx = subsample_indices(5, Duration::from_secs(3), &cfg);
        assert_eq!(idx, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn single_frame_is_rejected() {
        let seg = segment(1, Duration::from_millis(100));
        assert!(matches!(build_gif(&seg, &GifConfig::default()), Err(PilotError::EmptySegment)));
    }

    #[test]
    fn encodes_looping_gif() {
        let seg = segment(30, Duration::from_secs(1));
        let clip = build_gif(&seg, &GifConfig::default()).unwrap();
        assert_eq!(&clip.bytes[..6], b"GIF89a");
        assert_eq!(clip.frame_count, 24);
        assert_eq!(clip.frame_delay, Duration::from_millis(42));
    }

    #[test]
    fn long_sparse_segment_diverges() {
        // 3 frames over 4s: delay clamps to 500ms, playback 1.5s.
        let seg = segment(3, Duration::from_secs(4));
        let clip = build_gif(&seg, &GifConfig::default()).unwrap();
        assert_eq!(clip.frame_delay, Duration::from_millis(500));
        assert!(clip.divergence() > Duration::from_millis(500));
    }
}
