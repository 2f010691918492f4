//! Capture backend that reads the screenshot file written by the emulator
//! script.
//!
//! This is the lowest-fidelity source and the ultimate fallback: it is
//! always available and cannot record video.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capture::types::{CaptureFrame, VideoSegment};
use crate::capture::CaptureBackend;
use crate::error::PilotError;

/// Delay before re-reading a file the emulator may still be writing.
const REREAD_DELAY: Duration = Duration::from_millis(50);

pub struct EmulatorScreenshotCapture {
    path: Mutex<Option<PathBuf>>,
    sequence: AtomicU64,
}

impl EmulatorScreenshotCapture {
    pub fn new() -> Self {
        Self {
            path: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Start with a known screenshot path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let capture = Self::new();
        capture.point_at(path);
        capture
    }

    /// Use `path` for the next capture (taken from the latest protocol
    /// message).
    pub fn point_at(&self, path: impl Into<PathBuf>) {
        *self.path.lock() = Some(path.into());
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// Load one specific file as a frame.
    pub async fn load(&self, path: &Path) -> Result<CaptureFrame, PilotError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = match read_frame(path, seq).await {
            Ok(frame) => frame,
            Err(first) => {
                debug!(path = %path.display(), "screenshot unreadable ({first}); retrying once");
                tokio::time::sleep(REREAD_DELAY).await;
                read_frame(path, seq).await?
            }
        };
        Ok(frame
            .with_metadata("backend", "emulator")
            .with_metadata("path", path.display().to_string()))
    }
}

impl Default for EmulatorScreenshotCapture {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_frame(path: &Path, sequence: u64) -> Result<CaptureFrame, PilotError> {
    let bytes = tokio::fs::read(path).await?;
    CaptureFrame::from_encoded(&bytes, sequence)
}

#[async_trait]
impl CaptureBackend for EmulatorScreenshotCapture {
    fn name(&self) -> &'static str {
        "emulator"
    }

    async fn initialize(&self) -> bool {
        true
    }

    async fn capture_frame(&self) -> Option<CaptureFrame> {
        let path = self.current_path()?;
        match self.load(&path).await {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(path = %path.display(), "emulator screenshot capture failed: {e}");
                None
            }
        }
    }

    async fn start_recording(&self) -> bool {
        false
    }

    async fn stop_recording(&self) -> Option<VideoSegment> {
        None
    }

    fn is_available(&self) -> bool {
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
