//! Configuration for the gbpilot service.
//!
//! One TOML file, every section optional. The running service watches the
//! file and publishes new snapshots through a `watch` channel; a decision
//! cycle clones one snapshot when it starts and keeps it to the end.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gbpilot_core::capture::{CaptureConfig, EnhanceConfig, Region};
use gbpilot_core::decision::{FallbackConfig, ProcessOracleConfig, RetryPolicy, TimingConfig};
use gbpilot_core::protocol::GameConfigScript;
use gbpilot_core::video::{AnalyzerConfig, GifConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// Emulator socket settings.
    pub network: NetworkConfig,
    /// Frame sources.
    pub capture: CaptureSection,
    /// Frame enhancement before the oracle sees a frame.
    pub enhance: EnhanceConfig,
    /// Segment analysis and GIF assembly.
    pub analysis: AnalysisConfig,
    /// Retry, fallback and action timing.
    pub decision: DecisionConfig,
    /// External decision process.
    pub oracle: OracleConfig,
    /// Commentary queue.
    pub narration: NarrationConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Socket read poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Wait before the single bind retry, in milliseconds.
    pub bind_retry_ms: u64,
    /// Bound on every join during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

/// Capture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Backend type: "screen" or "emulator".
    #[serde(rename = "type")]
    pub kind: String,
    pub fps: u32,
    /// Window title substring used to find the emulator.
    pub window_title: String,
    /// Fixed capture rectangle; overrides window detection.
    pub region: Option<Region>,
    /// Record video between decisions instead of single screenshots.
    pub continuous_recording: bool,
    pub stop_timeout_ms: u64,
    pub max_buffer_frames: usize,
    /// Screenshot path handed to the emulator script.
    pub screenshot_path: String,
    /// Directory for PNG/GIF debug artifacts. Empty disables them.
    pub artifact_dir: String,
}

/// Analysis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub diff_threshold: f64,
    pub diff_size: u32,
    pub max_key_frames: usize,
    pub max_recommended: usize,
    pub gif_fps: f64,
    pub gif_max_frames: usize,
    pub gif_max_width: u32,
}

/// Decision configuration. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub cooldown_secs: f64,
    pub stabilization_base_secs: f64,
    pub movement_wait_secs: f64,
    pub interaction_wait_secs: f64,
    pub safety_max_secs: f64,
    pub separation_frames: u32,
    pub post_wait_frames: u32,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_multiplier: f64,
    pub backoff_max_secs: f64,
    /// Consecutive failed decisions before fallback actions.
    pub fallback_after: u32,
}

/// Oracle process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Program and arguments; receives the request JSON on stdin.
    pub command: Vec<String>,
    pub timeout_secs: f64,
    /// Where request images are written. Empty uses the temp directory.
    pub image_dir: String,
}

/// Narration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            capture: CaptureSection::default(),
            enhance: EnhanceConfig::default(),
            analysis: AnalysisConfig::default(),
            decision: DecisionConfig::default(),
            oracle: OracleConfig::default(),
            narration: NarrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8888,
            poll_interval_ms: 100,
            bind_retry_ms: 1000,
            shutdown_timeout_ms: 3000,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            kind: capture.kind,
            fps: capture.fps,
            window_title: capture.window_title,
            region: None,
            continuous_recording: false,
            stop_timeout_ms: capture.stop_timeout.as_millis() as u64,
            max_buffer_frames: capture.max_buffer_frames,
            screenshot_path: std::env::temp_dir()
                .join("gbpilot")
                .join("screenshot.png")
                .display()
                .to_string(),
            artifact_dir: String::new(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let analyzer = AnalyzerConfig::default();
        Self {
            diff_threshold: analyzer.diff_threshold,
            diff_size: analyzer.diff_size,
            max_key_frames: analyzer.max_key_frames,
            max_recommended: analyzer.max_recommended,
            gif_fps: analyzer.gif.target_fps,
            gif_max_frames: analyzer.gif.max_frames,
            gif_max_width: analyzer.gif.max_width,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        let timing = TimingConfig::default();
        let retry = RetryPolicy::default();
        Self {
            cooldown_secs: timing.cooldown.as_secs_f64(),
            stabilization_base_secs: timing.stabilization_base.as_secs_f64(),
            movement_wait_secs: timing.movement_wait.as_secs_f64(),
            interaction_wait_secs: timing.interaction_wait.as_secs_f64(),
            safety_max_secs: timing.safety_max.as_secs_f64(),
            separation_frames: timing.separation_frames,
            post_wait_frames: timing.post_wait_frames,
            max_retries: retry.max_retries,
            backoff_base_secs: retry.base_delay.as_secs_f64(),
            backoff_multiplier: retry.multiplier,
            backoff_max_secs: retry.max_delay.as_secs_f64(),
            fallback_after: FallbackConfig::default().failure_threshold,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60.0,
            image_dir: String::new(),
        }
    }
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: gbpilot_core::narration::NARRATION_QUEUE_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(if value.is_finite() { value.max(0.0) } else { 0.0 })
}

impl PilotConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse a file strictly; used on reload so a bad edit keeps the
    /// running configuration.
    pub fn try_load(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        toml::from_str(&contents).map_err(|e| e.to_string())
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.network.host, self.network.port).parse()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.network.poll_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.network.shutdown_timeout_ms)
    }

    pub fn bind_retry(&self) -> Duration {
        Duration::from_millis(self.network.bind_retry_ms)
    }

    /// Directory for debug artifacts, if enabled.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        let dir = self.capture.artifact_dir.trim();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }

    /// Convert capture settings into a `CaptureConfig`.
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            kind: self.capture.kind.clone(),
            fps: self.capture.fps.clamp(1, 60),
            region: self.capture.region,
            window_title: self.capture.window_title.clone(),
            stop_timeout: Duration::from_millis(self.capture.stop_timeout_ms),
            max_buffer_frames: self.capture.max_buffer_frames.max(1),
        }
    }

    pub fn to_analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            diff_threshold: self.analysis.diff_threshold.clamp(0.0, 1.0),
            diff_size: self.analysis.diff_size.clamp(4, 256),
            max_key_frames: self.analysis.max_key_frames.max(1),
            max_recommended: self.analysis.max_recommended.max(1),
            gif: GifConfig {
                target_fps: self.analysis.gif_fps.clamp(1.0, 24.0),
                max_frames: self.analysis.gif_max_frames.max(2),
                max_width: self.analysis.gif_max_width,
                ..GifConfig::default()
            },
        }
    }

    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.decision.max_retries,
            base_delay: secs(self.decision.backoff_base_secs),
            multiplier: self.decision.backoff_multiplier.max(1.0),
            max_delay: secs(self.decision.backoff_max_secs),
        }
    }

    pub fn to_timing_config(&self) -> TimingConfig {
        TimingConfig {
            stabilization_base: secs(self.decision.stabilization_base_secs),
            movement_wait: secs(self.decision.movement_wait_secs),
            interaction_wait: secs(self.decision.interaction_wait_secs),
            cooldown: secs(self.decision.cooldown_secs),
            safety_max: secs(self.decision.safety_max_secs),
            separation_frames: self.decision.separation_frames,
            post_wait_frames: self.decision.post_wait_frames,
        }
    }

    pub fn to_fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            failure_threshold: self.decision.fallback_after.max(1),
            ..FallbackConfig::default()
        }
    }

    pub fn to_oracle_config(&self) -> ProcessOracleConfig {
        let defaults = ProcessOracleConfig::default();
        ProcessOracleConfig {
            command: self.oracle.command.clone(),
            timeout: secs(self.oracle.timeout_secs),
            image_dir: match self.oracle.image_dir.trim() {
                "" => defaults.image_dir,
                dir => PathBuf::from(dir),
            },
        }
    }

    /// The table sent to the emulator script after `ready`.
    pub fn game_config_script(&self) -> GameConfigScript {
        GameConfigScript {
            screenshot_path: self.capture.screenshot_path.clone(),
            separation_frames: self.decision.separation_frames,
            post_wait_frames: self.decision.post_wait_frames,
            continuous_recording: self.capture.continuous_recording,
        }
    }
}

// ── Overrides ────────────────────────────────────────────────────

/// Command-line settings that win over the file, on startup and on every
/// reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut PilotConfig) {
        if let Some(host) = &self.host {
            config.network.host = host.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
    }
}

// ── Hot reload ───────────────────────────────────────────────────

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Poll `path` every `interval` and publish a new snapshot whenever its
/// modification time changes and it still parses. `overrides` are applied
/// to every reloaded snapshot.
pub fn spawn_config_watcher(
    path: PathBuf,
    initial: PilotConfig,
    overrides: ConfigOverrides,
    interval: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<Arc<PilotConfig>>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    let handle = tokio::spawn(async move {
        let mut last_seen = modified(&path).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = modified(&path).await;
            if current.is_none() || current == last_seen {
                continue;
            }
            last_seen = current;
            match PilotConfig::try_load(&path) {
                Ok(mut next) => {
                    overrides.apply(&mut next);
                    let previous = tx.borrow().clone();
                    if *previous == next {
                        debug!("config touched but unchanged");
                        continue;
                    }
                    if previous.network != next.network {
                        warn!("network settings change on restart only");
                    }
                    if previous.capture.kind != next.capture.kind {
                        warn!("capture backend changes on restart only");
                    }
                    info!(path = %path.display(), "configuration reloaded");
                    if tx.send(Arc::new(next)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(path = %path.display(), "config reload rejected: {e}"),
            }
        }
        debug!("config watcher stopped");
    });
    (rx, handle)
}

// ── Tests ────────────────────────────────────────────────────────
