//! Screen-region capture with a continuous recording loop.
//!
//! The backend finds the emulator window (via [`ScreenSource::locate`]),
//! grabs that rectangle on demand, and can record it at a fixed FPS on a
//! dedicated task.
//!
//! # Recording lock
//!
//! The `is_recording` flag and the frame buffer live under one mutex.
//! The recording task appends a frame only while holding the lock *and*
//! seeing its own generation still recording, so `stop_recording` can
//! swap the buffer out atomically without racing a late append.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use image::imageops;
use image::RgbaImage;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::types::{CaptureFrame, Region, VideoSegment};
use crate::capture::{CaptureBackend, CaptureConfig};
use crate::error::PilotError;

// ── ScreenSource ─────────────────────────────────────────────────

/// Where screen pixels come from. Calls may block.
pub trait ScreenSource: Send + Sync + 'static {
    /// Find the bounds of a window whose title or app name contains
    /// `title_hint`.
    fn locate(&self, title_hint: &str) -> Result<Option<Region>, PilotError>;

    /// Grab `region`, or the primary monitor when `None`.
    fn grab(&self, region: Option<Region>) -> Result<RgbaImage, PilotError>;
}

/// [`ScreenSource`] backed by `xcap` window enumeration and monitor capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct XcapSource;

impl ScreenSource for XcapSource {
    fn locate(&self, title_hint: &str) -> Result<Option<Region>, PilotError> {
        let hint = title_hint.to_lowercase();
        for window in xcap::Window::all()? {
            if window.is_minimized().unwrap_or(false) {
                continue;
            }
            let title = window.title().unwrap_or_default().to_lowercase();
            let app = window.app_name().unwrap_or_default().to_lowercase();
            if !title.contains(&hint) && !app.contains(&hint) {
                continue;
            }
            let region = Region::new(window.x()?, window.y()?, window.width()?, window.height()?);
            if region.is_empty() {
                continue;
            }
            return Ok(Some(region));
        }
        Ok(None)
    }

    fn grab(&self, region: Option<Region>) -> Result<RgbaImage, PilotError> {
        let monitors = xcap::Monitor::all()?;
        let monitor = match region {
            Some(r) => monitors.iter().find(|m| {
                monitor_bounds(m).is_some_and(|b| b.contains_point(r.x, r.y))
            }),
            None => monitors.iter().find(|m| m.is_primary().unwrap_or(false)),
        }
        .or_else(|| monitors.first())
        .ok_or_else(|| PilotError::Capture("no monitors found".into()))?;

        let full = monitor.capture_image()?;
        let Some(region) = region else {
            return Ok(full);
        };

        let origin = monitor_bounds(monitor)
            .ok_or_else(|| PilotError::Capture("monitor bounds unavailable".into()))?;
        crop_to(&full, origin, region)
    }
}

fn monitor_bounds(monitor: &xcap::Monitor) -> Option<Region> {
    Some(Region::new(
        monitor.x().ok()?,
        monitor.y().ok()?,
        monitor.width().ok()?,
        monitor.height().ok()?,
    ))
}

/// Crop a monitor image (whose top-left is `origin`) to `region`,
/// clamping at the monitor edge.
fn crop_to(full: &RgbaImage, origin: Region, region: Region) -> Result<RgbaImage, PilotError> {
    let left = (region.x - origin.x).max(0) as u32;
    let top = (region.y - origin.y).max(0) as u32;
    if left >= full.width() || top >= full.height() {
        return Err(PilotError::Capture(format!(
            "region {region:?} lies outside the monitor"
        )));
    }
    let width = region.width.min(full.width() - left);
    let height = region.height.min(full.height() - top);
    Ok(imageops::crop_imm(full, left, top, width, height).to_image())
}

// ── Recording state ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct RecordingBuffer {
    is_recording: bool,
    /// Bumped on every start so a stale task can never append.
    generation: u64,
    frames: Vec<CaptureFrame>,
    started: Option<(Instant, SystemTime)>,
    overflow_logged: bool,
}

struct Shared {
    source: Arc<dyn ScreenSource>,
    config: CaptureConfig,
    region: Mutex<Option<Region>>,
    recording: Mutex<RecordingBuffer>,
    sequence: AtomicU64,
    available: AtomicBool,
}

impl Shared {
    async fn grab_frame(self: &Arc<Self>) -> Result<CaptureFrame, PilotError> {
        let region = *self.region.lock();
        let source = Arc::clone(&self.source);
        let image = tokio::task::spawn_blocking(move || source.grab(region))
            .await
            .map_err(|e| PilotError::Capture(format!("capture task panicked: {e}")))??;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(CaptureFrame::new(image, seq).with_metadata("backend", "screen"))
    }

    /// Timer loop: one grab per frame interval until the generation stops.
    async fn record(self: Arc<Self>, generation: u64) {
        let interval = Duration::from_secs_f64(1.0 / self.config.fps.clamp(1, 60) as f64);
        let mut failures = 0u32;

        loop {
            let tick = Instant::now();
            {
                let buf = self.recording.lock();
                if !buf.is_recording || buf.generation != generation {
                    break;
                }
            }

            match self.grab_frame().await {
                Ok(frame) => {
                    failures = 0;
                    let mut buf = self.recording.lock();
                    if !buf.is_recording || buf.generation != generation {
                        break;
                    }
                    if buf.frames.len() < self.config.max_buffer_frames {
                        buf.frames.push(frame);
                    } else if !buf.overflow_logged {
                        buf.overflow_logged = true;
                        warn!(
                            max = self.config.max_buffer_frames,
                            "recording buffer full; dropping further frames"
                        );
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 30 == 0 {
                        warn!(failures, "frame grab failed during recording: {e}");
                    }
                }
            }

            let elapsed = tick.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        debug!(generation, "recording loop exited");
    }
}

// ── ScreenCapture ────────────────────────────────────────────────

/// Screen-region capture backend.
pub struct ScreenCapture {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenCapture {
    pub fn new(source: impl ScreenSource, config: CaptureConfig) -> Self {
        let region = config.region;
        Self {
            shared: Arc::new(Shared {
                source: Arc::new(source),
                config,
                region: Mutex::new(region),
                recording: Mutex::new(RecordingBuffer::default()),
                sequence: AtomicU64::new(0),
                available: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// The rectangle currently being captured (`None` = full screen).
    pub fn region(&self) -> Option<Region> {
        *self.shared.region.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.lock().is_recording
    }

    /// Grab one frame. Fails with [`PilotError::CaptureUnavailable`] until
    /// [`CaptureBackend::initialize`] has found the source.
    pub async fn grab(&self) -> Result<CaptureFrame, PilotError> {
        if !self.is_available() {
            return Err(PilotError::CaptureUnavailable("screen"));
        }
        self.shared.grab_frame().await
    }

    async fn join_task(&self) {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(self.shared.config.stop_timeout, handle)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.shared.config.stop_timeout,
                "recording loop did not stop in time; aborting"
            );
            abort.abort();
        }
    }
}

#[async_trait]
impl CaptureBackend for ScreenCapture {
    fn name(&self) -> &'static str {
        "screen"
    }

    async fn initialize(&self) -> bool {
        let config = &self.shared.config;
        if config.region.is_none() && !config.window_title.is_empty() {
            let source = Arc::clone(&self.shared.source);
            let hint = config.window_title.clone();
            let located = tokio::task::spawn_blocking(move || source.locate(&hint))
                .await
                .map_err(|e| PilotError::Capture(e.to_string()))
                .and_then(|r| r);
            match located {
                Ok(Some(region)) => {
                    info!(?region, title = %config.window_title, "emulator window located");
                    *self.shared.region.lock() = Some(region);
                }
                Ok(None) => warn!(
                    title = %config.window_title,
                    "emulator window not found; falling back to full-screen capture"
                ),
                Err(e) => warn!("window detection failed ({e}); falling back to full-screen capture"),
            }
        }

        let ok = match self.shared.grab_frame().await {
            Ok(_) => true,
            Err(e) => {
                warn!("screen capture check failed: {e}");
                false
            }
        };
        self.shared.available.store(ok, Ordering::SeqCst);
        ok
    }

    async fn capture_frame(&self) -> Option<CaptureFrame> {
        match self.grab().await {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("screen capture failed: {e}");
                None
            }
        }
    }

    async fn start_recording(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        let generation = {
            let mut buf = self.shared.recording.lock();
            if buf.is_recording {
                return false;
            }
            buf.generation += 1;
            buf.is_recording = true;
            buf.frames.clear();
            buf.overflow_logged = false;
            buf.started = Some((Instant::now(), SystemTime::now()));
            buf.generation
        };

        // A previous loop may still be winding down.
        self.join_task().await;

        let shared = Arc::clone(&self.shared);
        *self.task.lock() = Some(tokio::spawn(shared.record(generation)));
        debug!(generation, "recording started");
        true
    }

    async fn stop_recording(&self) -> Option<VideoSegment> {
        let (frames, started) = {
            let mut buf = self.shared.recording.lock();
            if !buf.is_recording {
                return None;
            }
            buf.is_recording = false;
            (std::mem::take(&mut buf.frames), buf.started.take())
        };
        let end = Instant::now();

        self.join_task().await;

        let (start, started_at) = started.unwrap_or((end, SystemTime::now()));
        let segment = VideoSegment::seal(frames, started_at, start, end);
        debug!(
            frames = segment.len(),
            duration = ?segment.duration(),
            "recording sealed"
        );
        Some(segment)
    }

    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shared.recording.lock().is_recording = false;
        self.join_task().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────
