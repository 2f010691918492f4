//! End-to-end tests: a fake emulator script talks to the service over
//! localhost while a scripted oracle answers decisions.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gbpilot_core::capture::{CaptureBackend, CaptureChain, CaptureFrame, VideoSegment};
use gbpilot_core::decision::{DecisionOracle, OracleRequest, OracleResponse};
use gbpilot_core::PilotError;
use gbpilot_server::config::PilotConfig;
use gbpilot_server::service::PilotService;

const STEP: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────

struct Scripted {
    replies: Mutex<VecDeque<OracleResponse>>,
    calls: Mutex<usize>,
    animated: Mutex<Vec<bool>>,
    delay: Duration,
}

impl Scripted {
    fn new(replies: Vec<OracleResponse>) -> Arc<Self> {
        Self::slow(replies, Duration::ZERO)
    }

    /// Every call takes `delay` before answering.
    fn slow(replies: Vec<OracleResponse>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
            animated: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock()
    }

    /// Whether each request so far carried an animation.
    fn animated(&self) -> Vec<bool> {
        self.animated.lock().clone()
    }
}

#[async_trait]
impl DecisionOracle for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(&self, request: &OracleRequest) -> OracleResponse {
        assert!(!request.images.is_empty());
        *self.calls.lock() += 1;
        self.animated.lock().push(request.has_animation());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| OracleResponse::ok(&["A"], "default"))
    }
}

fn test_config() -> PilotConfig {
    let mut cfg = PilotConfig::default();
    cfg.capture.kind = "emulator".into();
    cfg.narration.enabled = false;
    cfg.network.poll_interval_ms = 10;
    cfg.network.shutdown_timeout_ms = 1000;
    cfg.decision.cooldown_secs = 0.01;
    cfg.decision.stabilization_base_secs = 0.01;
    cfg.decision.movement_wait_secs = 0.01;
    cfg.decision.interaction_wait_secs = 0.01;
    cfg.decision.backoff_base_secs = 0.001;
    cfg.decision.backoff_max_secs = 0.01;
    cfg
}

fn screenshot(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gbpilot-service-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.png"));
    image::RgbaImage::from_pixel(16, 16, image::Rgba([40, 120, 40, 255]))
        .save(&path)
        .unwrap();
    path
}

fn frame(shade: u8, seq: u64) -> CaptureFrame {
    CaptureFrame::new(image::RgbaImage::from_pixel(24, 24, image::Rgba([shade, shade, shade, 255])), seq)
}

/// Screen backend that always has a frame and hands back a moving clip
/// whenever a recording stops.
#[derive(Default)]
struct Recorder {
    starts: Mutex<usize>,
}

#[async_trait]
impl CaptureBackend for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn initialize(&self) -> bool {
        true
    }

    async fn capture_frame(&self) -> Option<CaptureFrame> {
        Some(frame(90, 0))
    }

    async fn start_recording(&self) -> bool {
        *self.starts.lock() += 1;
        true
    }

    async fn stop_recording(&self) -> Option<VideoSegment> {
        Some(VideoSegment::from_frames(
            (0..6).map(|i| frame((i * 40) as u8, i)).collect(),
        ))
    }

    fn is_available(&self) -> bool {
        true
    }
}

type Running = (std::net::SocketAddr, CancellationToken, JoinHandle<Result<(), PilotError>>);

async fn start(oracle: Arc<Scripted>) -> Running {
    start_with(test_config(), oracle, None).await
}

async fn start_with(config: PilotConfig, oracle: Arc<Scripted>, capture: Option<CaptureChain>) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut service = PilotService::with_config(config, oracle);
    if let Some(mut chain) = capture {
        chain.initialize().await;
        service = service.with_capture(Arc::new(chain));
    }
    let stop = service.shutdown_handle();
    let handle = tokio::spawn(async move { service.run_with_listener(listener).await });
    (addr, stop, handle)
}

struct Emulator {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Emulator {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("timed out waiting for the service")
            .unwrap()
    }

    async fn handshake(&mut self) {
        self.send("ready").await;
        let config = self.recv().await.unwrap();
        assert!(config.starts_with("game_config||{"), "{config}");
        self.send("config_loaded").await;
        assert_eq!(self.recv().await.as_deref(), Some("request_screenshot"));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn screenshot_cycle_dispatches_buttons() {
    let oracle = Scripted::new(vec![OracleResponse::ok(&["UP"], "heading north")]);
    let (addr, stop, handle) = start(Arc::clone(&oracle)).await;

    let mut emu = Emulator::connect(addr).await;
    emu.handshake().await;

    let shot = screenshot("cycle");
    emu.send(&format!("screenshot_with_state||{}||1||5||6||3", shot.display()))
        .await;
    assert_eq!(emu.recv().await.as_deref(), Some("6|2"));
    assert_eq!(emu.recv().await.as_deref(), Some("request_screenshot"));
    assert_eq!(oracle.calls(), 1);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn auth_failure_sends_no_buttons() {
    let oracle = Scripted::new(vec![OracleResponse::failed("invalid api key")]);
    let (addr, stop, handle) = start(Arc::clone(&oracle)).await;

    let mut emu = Emulator::connect(addr).await;
    emu.handshake().await;

    let shot = screenshot("auth");
    emu.send(&format!("screenshot_with_state||{}||2||1||1||1", shot.display()))
        .await;
    assert_eq!(emu.recv().await.as_deref(), Some("request_screenshot"));
    assert_eq!(oracle.calls(), 1);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn config_error_keeps_session_open() {
    let oracle = Scripted::new(vec![]);
    let (addr, stop, handle) = start(oracle).await;

    let mut emu = Emulator::connect(addr).await;
    emu.send("ready").await;
    assert!(emu.recv().await.unwrap().starts_with("game_config||"));
    emu.send("config_error||bad table").await;
    emu.send("garbage line").await;
    emu.send("config_loaded").await;
    assert_eq!(emu.recv().await.as_deref(), Some("request_screenshot"));

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn new_connection_supersedes_old() {
    let oracle = Scripted::new(vec![]);
    let (addr, stop, handle) = start(oracle).await;

    let mut first = Emulator::connect(addr).await;
    first.send("ready").await;
    assert!(first.recv().await.unwrap().starts_with("game_config||"));

    let mut second = Emulator::connect(addr).await;
    second.send("ready").await;
    assert!(second.recv().await.unwrap().starts_with("game_config||"));

    // The first socket is closed by the service.
    assert_eq!(first.recv().await, None);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_without_clients() {
    let (_addr, stop, handle) = start(Scripted::new(vec![])).await;
    stop.cancel();
    let result = tokio::time::timeout(STEP, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn triggers_during_a_decision_are_ignored() {
    let oracle = Scripted::slow(vec![OracleResponse::ok(&["UP"], "")], Duration::from_millis(400));
    let (addr, stop, handle) = start(Arc::clone(&oracle)).await;

    let mut emu = Emulator::connect(addr).await;
    emu.handshake().await;

    let shot = screenshot("busy");
    let line = format!("screenshot_with_state||{}||1||5||6||3", shot.display());
    emu.send(&line).await;
    emu.send(&line).await;
    assert_eq!(emu.recv().await.as_deref(), Some("6|2"));
    assert_eq!(emu.recv().await.as_deref(), Some("request_screenshot"));

    // Nothing else is queued behind the first cycle.
    let extra = tokio::time::timeout(Duration::from_millis(300), emu.lines.next_line()).await;
    assert!(extra.is_err(), "unexpected line: {extra:?}");
    assert_eq!(oracle.calls(), 1);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn frames_before_config_loaded_are_ignored() {
    let oracle = Scripted::new(vec![]);
    let (addr, stop, handle) = start(Arc::clone(&oracle)).await;

    let mut emu = Emulator::connect(addr).await;
    let shot = screenshot("early");
    emu.send(&format!("screenshot_with_state||{}||1||5||6||3", shot.display()))
        .await;
    emu.send("state||1||5||6||3").await;
    emu.handshake().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(oracle.calls(), 0);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn takeover_does_not_wait_for_a_slow_decision() {
    let oracle = Scripted::slow(vec![], Duration::from_secs(15));
    let mut config = test_config();
    config.network.shutdown_timeout_ms = 500;
    let (addr, stop, handle) = start_with(config, Arc::clone(&oracle), None).await;

    let mut first = Emulator::connect(addr).await;
    first.handshake().await;
    let shot = screenshot("takeover");
    first
        .send(&format!("screenshot_with_state||{}||1||5||6||3", shot.display()))
        .await;
    let deadline = Instant::now() + STEP;
    while oracle.calls() == 0 {
        assert!(Instant::now() < deadline, "oracle was never called");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    let mut second = Emulator::connect(addr).await;
    second.send("ready").await;
    assert!(second.recv().await.unwrap().starts_with("game_config||"));
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert_eq!(first.recv().await, None);

    // The new session gets its own decisions.
    second.send("config_loaded").await;
    assert_eq!(second.recv().await.as_deref(), Some("request_screenshot"));

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn continuous_recording_sends_clip_then_static_retry() {
    let oracle = Scripted::new(vec![
        OracleResponse::ok(&["UP"], "walk"),
        OracleResponse::failed("unsupported image format: gif"),
        OracleResponse::ok(&["A"], "talk"),
    ]);
    let mut config = test_config();
    config.capture.continuous_recording = true;
    config.decision.post_wait_frames = 6;
    let recorder = Arc::new(Recorder::default());
    let chain = CaptureChain::with_primary(Arc::clone(&recorder) as Arc<dyn CaptureBackend>);
    let (addr, stop, handle) = start_with(config, Arc::clone(&oracle), Some(chain)).await;

    let mut emu = Emulator::connect(addr).await;
    emu.handshake().await;

    let shot = screenshot("recording");
    emu.send(&format!("screenshot_with_state||{}||1||5||6||3", shot.display()))
        .await;
    assert_eq!(emu.recv().await.as_deref(), Some("6|2"));
    assert_eq!(emu.recv().await.as_deref(), Some("request_state"));

    emu.send("state||1||5||5||3").await;
    assert_eq!(emu.recv().await.as_deref(), Some("0|2"));
    assert_eq!(emu.recv().await.as_deref(), Some("request_state"));

    // Screenshot, rejected clip, then the first/last pair.
    assert_eq!(oracle.animated(), vec![false, true, false]);
    assert_eq!(*recorder.starts.lock(), 2);

    stop.cancel();
    tokio::time::timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}
