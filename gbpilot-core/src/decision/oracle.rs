//! The decision-oracle seam.
//!
//! The oracle is an opaque, fallible dependency: it receives images, a
//! game-state summary, free-text context and a fixed tool schema, and
//! answers with an [`OracleResponse`]. It never returns `Err`; failures are
//! reported in-band through `success = false` plus an error string so the
//! engine can classify them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capture::CaptureFrame;
use crate::error::PilotError;
use crate::protocol::buttons::{Button, MAX_BUTTON_FRAMES, MIN_BUTTON_FRAMES};
use crate::state::GameState;
use crate::video::FramePayload;

// ── Request ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Gif,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
        }
    }
}

/// One encoded image handed to the oracle.
#[derive(Debug, Clone)]
pub struct OracleImage {
    /// `current`, `before`, `after` or `animation`.
    pub label: &'static str,
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub images: Vec<OracleImage>,
    pub state: Option<GameState>,
    pub state_summary: String,
    pub context: String,
    pub tools: Value,
}

impl OracleRequest {
    /// Encode a frame payload into images.
    pub fn from_payload(
        payload: &FramePayload,
        state: Option<&GameState>,
        state_summary: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<Self, PilotError> {
        let png = |label: &'static str, frame: &CaptureFrame| -> Result<OracleImage, PilotError> {
            Ok(OracleImage {
                label,
                format: ImageFormat::Png,
                bytes: frame.to_png()?,
            })
        };
        let images = match payload {
            FramePayload::Single(frame) => vec![png("current", frame)?],
            FramePayload::Pair { before, after } => vec![png("before", before)?, png("after", after)?],
            FramePayload::Animated { clip, .. } => vec![OracleImage {
                label: "animation",
                format: ImageFormat::Gif,
                bytes: clip.bytes.clone(),
            }],
        };
        Ok(Self {
            images,
            state: state.cloned(),
            state_summary: state_summary.into(),
            context: context.into(),
            tools: tool_schema(),
        })
    }

    pub fn has_animation(&self) -> bool {
        self.images.iter().any(|i| i.format == ImageFormat::Gif)
    }
}

/// The fixed tool schema offered to the oracle.
pub fn tool_schema() -> Value {
    let names: Vec<&str> = Button::ALL.iter().map(|b| b.name()).collect();
    json!([
        {
            "name": "press_buttons",
            "description": "Press a sequence of Game Boy buttons in order.",
            "parameters": {
                "type": "object",
                "properties": {
                    "buttons": {
                        "type": "array",
                        "items": { "type": "string", "enum": names }
                    },
                    "durations": {
                        "type": "array",
                        "description": "Frames to hold each button, at 60 fps.",
                        "items": {
                            "type": "integer",
                            "minimum": MIN_BUTTON_FRAMES,
                            "maximum": MAX_BUTTON_FRAMES
                        }
                    }
                },
                "required": ["buttons"]
            }
        },
        {
            "name": "update_note",
            "description": "Replace the long-term note carried between decisions.",
            "parameters": {
                "type": "object",
                "properties": { "note": { "type": "string" } },
                "required": ["note"]
            }
        }
    ])
}

// ── Response ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleResponse {
    pub success: bool,
    pub text: String,
    /// Button names in press order.
    pub actions: Vec<String>,
    /// Frames per action, positionally matched.
    pub durations: Option<Vec<u32>>,
    pub error: Option<String>,
    /// Replacement for the long-term note.
    pub note: Option<String>,
}

impl OracleResponse {
    pub fn ok(actions: &[&str], text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_durations(mut self, durations: Vec<u32>) -> Self {
        self.durations = Some(durations);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ── DecisionOracle ───────────────────────────────────────────────

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, request: &OracleRequest) -> OracleResponse;
}

// ── ProcessOracle ────────────────────────────────────────────────

/// Settings for [`ProcessOracle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOracleConfig {
    /// Program and arguments. Empty disables the oracle.
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Where request images are written.
    pub image_dir: PathBuf,
}

impl Default for ProcessOracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout: Duration::from_secs(60),
            image_dir: std::env::temp_dir().join("gbpilot-oracle"),
        }
    }
}

/// Runs an external program once per decision.
///
/// The request goes to the child's stdin as one JSON document with image
/// file paths; the child answers with an [`OracleResponse`] JSON document
/// on stdout.
pub struct ProcessOracle {
    config: ProcessOracleConfig,
    sequence: AtomicU64,
}

#[derive(Serialize)]
struct WireImage<'a> {
    label: &'a str,
    format: ImageFormat,
    path: PathBuf,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    images: Vec<WireImage<'a>>,
    state: Option<&'a GameState>,
    state_summary: &'a str,
    context: &'a str,
    tools: &'a Value,
}

impl ProcessOracle {
    pub fn new(config: ProcessOracleConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    async fn write_images<'a>(&self, request: &'a OracleRequest) -> Result<Vec<WireImage<'a>>, PilotError> {
        tokio::fs::create_dir_all(&self.config.image_dir).await?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(request.images.len());
        for image in &request.images {
            let path = self
                .config
                .image_dir
                .join(format!("request_{seq:06}_{}.{}", image.label, image.format.extension()));
            tokio::fs::write(&path, &image.bytes).await?;
            out.push(WireImage {
                label: image.label,
                format: image.format,
                path,
            });
        }
        Ok(out)
    }

    async fn run(&self, request: &OracleRequest) -> Result<OracleResponse, PilotError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| PilotError::Oracle("no oracle command configured".into()))?;

        let wire = WireRequest {
            images: self.write_images(request).await?,
            state: request.state.as_ref(),
            state_summary: &request.state_summary,
            context: &request.context,
            tools: &request.tools,
        };
        let body = serde_json::to_vec(&wire)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Writing the request counts against the deadline too: a child that
        // never reads stdin would otherwise stall on a full pipe.
        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&body).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| PilotError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::Oracle(format!(
                "oracle process exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(PilotError::Oracle("empty response from oracle process".into()));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl DecisionOracle for ProcessOracle {
    fn name(&self) -> &str {
        "process"
    }

    async fn decide(&self, request: &OracleRequest) -> OracleResponse {
        match self.run(request).await {
            Ok(response) => {
                debug!(success = response.success, actions = ?response.actions, "oracle answered");
                response
            }
            Err(e) => {
                warn!("oracle process failed: {e}");
                let message = match e {
                    PilotError::Encoding(e) => format!("malformed oracle response (json): {e}"),
                    other => other.to_string(),
                };
                OracleResponse::failed(message)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
