//! Frame and segment types shared by the capture backends and the analyzer.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::PilotError;

// ── Region ───────────────────────────────────────────────────────

/// A rectangle in virtual-screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && (x as i64) < self.x as i64 + self.width as i64
            && (y as i64) < self.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

// ── CaptureFrame ─────────────────────────────────────────────────

/// One captured image.
///
/// Pixel data sits behind an `Arc` so copying a frame (or a whole
/// segment) never duplicates the bitmap.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Decoded RGBA pixels.
    pub image: Arc<RgbaImage>,
    /// Wall-clock capture time.
    pub timestamp: SystemTime,
    /// Monotonic capture time, used for intra-segment offsets.
    pub captured_at: Instant,
    /// Per-backend sequence number.
    pub sequence: u64,
    /// Free-form annotations (source path, backend, enhancement, …).
    pub metadata: BTreeMap<String, String>,
}

impl CaptureFrame {
    pub fn new(image: RgbaImage, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            timestamp: SystemTime::now(),
            captured_at: Instant::now(),
            sequence,
            metadata: BTreeMap::new(),
        }
    }

    /// Decode a PNG (or any format `image` was built with) from memory.
    pub fn from_encoded(bytes: &[u8], sequence: u64) -> Result<Self, PilotError> {
        let image = image::load_from_memory(bytes)?.to_rgba8();
        Ok(Self::new(image, sequence))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Content digest over dimensions and pixels.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.image.width().to_le_bytes());
        hasher.update(&self.image.height().to_le_bytes());
        hasher.update(self.image.as_raw());
        hasher.finalize()
    }

    /// `true` when both frames hold bit-identical pixels.
    pub fn same_pixels(&self, other: &CaptureFrame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
            || (self.image.dimensions() == other.image.dimensions()
                && self.image.as_raw() == other.image.as_raw())
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>, PilotError> {
        let mut out = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        Ok(out)
    }

    /// Write a PNG to disk (debug artifacts and oracle payloads).
    pub fn save_png(&self, path: &Path) -> Result<(), PilotError> {
        self.image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

// ── VideoSegment ─────────────────────────────────────────────────

/// An ordered, sealed run of frames between a recording start and stop.
///
/// There is no mutating API: once sealed, a segment only hands out
/// shared references to its frames.
#[derive(Debug, Clone)]
pub struct VideoSegment {
    frames: Arc<[CaptureFrame]>,
    started_at: SystemTime,
    start: Instant,
    end: Instant,
}

impl VideoSegment {
    /// Seal `frames` recorded between `start` and `end`.
    pub fn seal(frames: Vec<CaptureFrame>, started_at: SystemTime, start: Instant, end: Instant) -> Self {
        Self {
            frames: frames.into(),
            started_at,
            start,
            end: end.max(start),
        }
    }

    /// Seal frames whose own timestamps bound the segment.
    pub fn from_frames(frames: Vec<CaptureFrame>) -> Self {
        let now = Instant::now();
        let start = frames.first().map_or(now, |f| f.captured_at);
        let end = frames.last().map_or(now, |f| f.captured_at);
        let started_at = frames.first().map_or_else(SystemTime::now, |f| f.timestamp);
        Self::seal(frames, started_at, start, end)
    }

    pub fn frames(&self) -> &[CaptureFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first(&self) -> Option<&CaptureFrame> {
        self.frames.first()
    }

    pub fn last(&self) -> Option<&CaptureFrame> {
        self.frames.last()
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Length of the recording window.
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }

    /// Effective capture rate over the window.
    pub fn fps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.frames.len() as f64 / secs
        }
    }

    /// Offset of `frame` from the start of the recording window.
    pub fn offset_of(&self, frame: &CaptureFrame) -> Duration {
        frame.captured_at.saturating_duration_since(self.start)
    }
}

// ── Tests ────────────────────────────────────────────────────────
