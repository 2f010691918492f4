//! # Capture System
//!
//! Frame sources behind one [`CaptureBackend`] trait:
//!
//! | Type string | Backend                       | Records video |
//! |-------------|-------------------------------|---------------|
//! | `screen`    | [`ScreenCapture`]             | yes           |
//! | `emulator`  | [`EmulatorScreenshotCapture`] | no            |
//!
//! [`CaptureChain`] pairs the configured backend with the emulator
//! screenshot fallback and degrades screen → emulator-screenshot when the
//! primary source cannot deliver.

pub mod emulator;
pub mod enhance;
pub mod screen;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::PilotError;

pub use emulator::EmulatorScreenshotCapture;
pub use enhance::{enhance, EnhanceConfig};
pub use screen::{ScreenCapture, ScreenSource, XcapSource};
pub use types::{CaptureFrame, Region, VideoSegment};

// ── CaptureConfig ────────────────────────────────────────────────

/// Configuration shared by the capture backends.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Backend type string (`screen`, `emulator`).
    pub kind: String,
    /// Recording rate.
    pub fps: u32,
    /// Fixed capture rectangle; skips window detection when set.
    pub region: Option<Region>,
    /// Substring matched against window titles during detection.
    pub window_title: String,
    /// How long to wait for the recording loop to exit.
    pub stop_timeout: Duration,
    /// Upper bound on frames buffered during one recording.
    pub max_buffer_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            kind: "screen".into(),
            fps: 30,
            region: None,
            window_title: "mGBA".into(),
            stop_timeout: Duration::from_secs(2),
            max_buffer_frames: 30 * 60,
        }
    }
}

// ── CaptureBackend ───────────────────────────────────────────────

/// A source of timestamped frames.
///
/// Methods take `&self`; backends keep their mutable state behind locks so
/// one instance can be shared between the session and the recorder.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Type string this backend is registered under.
    fn name(&self) -> &'static str;

    /// Check the source. Returns whether it can deliver frames.
    async fn initialize(&self) -> bool;

    /// Grab a single frame now.
    async fn capture_frame(&self) -> Option<CaptureFrame>;

    /// Begin continuous recording. `false` if unsupported or already running.
    async fn start_recording(&self) -> bool;

    /// Stop recording and hand back the sealed segment.
    async fn stop_recording(&self) -> Option<VideoSegment>;

    fn is_available(&self) -> bool;

    /// Upscale and colour-boost a frame for the oracle.
    fn enhance_frame(&self, frame: &CaptureFrame, config: &EnhanceConfig) -> CaptureFrame {
        enhance::enhance(frame, config).unwrap_or_else(|e| {
            warn!(backend = self.name(), "frame enhancement failed: {e}");
            frame.clone()
        })
    }

    /// Stop background work. Must not block indefinitely.
    async fn shutdown(&self) {}
}

/// Build a backend from its type string.
pub fn create_backend(config: &CaptureConfig) -> Result<Arc<dyn CaptureBackend>, PilotError> {
    match config.kind.as_str() {
        "screen" => Ok(Arc::new(ScreenCapture::new(XcapSource, config.clone()))),
        "emulator" => Ok(Arc::new(EmulatorScreenshotCapture::new())),
        other => Err(PilotError::Other(format!("unknown capture type {other:?}"))),
    }
}

// ── CaptureChain ─────────────────────────────────────────────────

/// The configured backend plus the always-available emulator fallback.
pub struct CaptureChain {
    primary: Option<Arc<dyn CaptureBackend>>,
    emulator: Arc<EmulatorScreenshotCapture>,
}

impl CaptureChain {
    /// Chain with only the emulator screenshot source.
    pub fn emulator_only() -> Self {
        Self {
            primary: None,
            emulator: Arc::new(EmulatorScreenshotCapture::new()),
        }
    }

    /// Chain with an explicit primary backend.
    pub fn with_primary(primary: Arc<dyn CaptureBackend>) -> Self {
        Self {
            primary: Some(primary),
            emulator: Arc::new(EmulatorScreenshotCapture::new()),
        }
    }

    /// Build from configuration via [`create_backend`].
    pub fn from_config(config: &CaptureConfig) -> Result<Self, PilotError> {
        if config.kind == "emulator" {
            return Ok(Self::emulator_only());
        }
        Ok(Self::with_primary(create_backend(config)?))
    }

    /// Initialize the primary backend, dropping it if unavailable.
    pub async fn initialize(&mut self) {
        if let Some(primary) = &self.primary {
            if primary.initialize().await {
                info!(backend = primary.name(), "capture backend ready");
            } else {
                warn!(
                    backend = primary.name(),
                    "capture backend unavailable; using emulator screenshots"
                );
                self.primary = None;
            }
        }
        self.emulator.initialize().await;
    }

    /// Name of the backend frames currently come from.
    pub fn active_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .filter(|p| p.is_available())
            .map_or(self.emulator.name(), |p| p.name())
    }

    /// Tell the emulator fallback where the newest screenshot lives.
    pub fn point_at(&self, path: impl Into<PathBuf>) {
        self.emulator.point_at(path);
    }

    pub fn emulator(&self) -> &EmulatorScreenshotCapture {
        &self.emulator
    }

    /// Whether continuous recording is possible at all.
    pub fn supports_recording(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| p.is_available())
    }

    /// Grab from the primary backend, degrading to the emulator screenshot.
    pub async fn capture_frame(&self) -> Option<CaptureFrame> {
        if let Some(primary) = self.primary.as_ref().filter(|p| p.is_available()) {
            if let Some(frame) = primary.capture_frame().await {
                return Some(frame);
            }
            warn!(backend = primary.name(), "primary capture failed; using emulator screenshot");
        }
        self.emulator.capture_frame().await
    }

    pub async fn start_recording(&self) -> bool {
        match &self.primary {
            Some(primary) if primary.is_available() => primary.start_recording().await,
            _ => false,
        }
    }

    pub async fn stop_recording(&self) -> Option<VideoSegment> {
        match &self.primary {
            Some(primary) => primary.stop_recording().await,
            None => None,
        }
    }

    pub fn enhance_frame(&self, frame: &CaptureFrame, config: &EnhanceConfig) -> CaptureFrame {
        match &self.primary {
            Some(primary) => primary.enhance_frame(frame, config),
            None => self.emulator.enhance_frame(frame, config),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(primary) = &self.primary {
            primary.shutdown().await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    struct FixedSource;

    impl ScreenSource for FixedSource {
        fn locate(&self, _title_hint: &str) -> Result<Option<Region>, PilotError> {
            Ok(None)
        }

        fn grab(&self, _region: Option<Region>) -> Result<RgbaImage, PilotError> {
            Ok(RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255])))
        }
    }

    struct BrokenSource;

    impl ScreenSource for BrokenSource {
        fn locate(&self, _title_hint: &str) -> Result<Option<Region>, PilotError> {
            Err(PilotError::Capture("no windowing system".into()))
        }

        fn grab(&self, _region: Option<Region>) -> Result<RgbaImage, PilotError> {
            Err(PilotError::Capture("no display".into()))
        }
    }

    #[test]
    fn factory_knows_type_strings() {
        let emulator = CaptureConfig {
            kind: "emulator".into(),
            ..Default::default()
        };
        assert_eq!(create_backend(&emulator).unwrap().name(), "emulator");

        let bogus = CaptureConfig {
            kind: "webcam".into(),
            ..Default::default()
        };
        assert!(create_backend(&bogus).is_err());
    }

    #[tokio::test]
    async fn broken_primary_degrades_to_emulator() {
        let primary: Arc<dyn CaptureBackend> =
            Arc::new(ScreenCapture::new(BrokenSource, CaptureConfig::default()));
        let mut chain = CaptureChain::with_primary(primary);
        chain.initialize().await;
        assert_eq!(chain.active_name(), "emulator");
        assert!(!chain.supports_recording());
        assert!(!chain.start_recording().await);
        assert!(chain.stop_recording().await.is_none());
    }

    #[tokio::test]
    async fn screen_frame_used_when_emulator_has_nothing() {
        let primary: Arc<dyn CaptureBackend> =
            Arc::new(ScreenCapture::new(FixedSource, CaptureConfig::default()));
        let mut chain = CaptureChain::with_primary(primary);
        chain.initialize().await;
        assert_eq!(chain.active_name(), "screen");
        let frame = chain.capture_frame().await.unwrap();
        assert_eq!(frame.metadata.get("backend").unwrap(), "screen");
    }

    #[tokio::test]
    async fn enhance_falls_back_to_original_on_error() {
        let chain = CaptureChain::emulator_only();
        let empty = CaptureFrame::new(RgbaImage::new(0, 0), 0);
        let out = chain.enhance_frame(&empty, &EnhanceConfig::default());
        assert_eq!(out.width(), 0);
    }
}
