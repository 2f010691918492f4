//! # gbpilot-core
//!
//! Core library for the gbpilot emulator control loop.
//!
//! This crate contains:
//! - **Protocol types**: `Inbound`, `Outbound`, `Button`, `ButtonCommand`, `GameConfigScript`
//! - **Codec**: `EmulatorCodec` for newline-framed TCP I/O via `tokio_util`
//! - **Capture**: `CaptureBackend` with screen-region and emulator-screenshot backends
//! - **Video**: frame differencing, key frames, GIF assembly, `VideoAnalyzer`
//! - **State**: `GameState` parsing, `GameStateTracker`, `SessionPhase`
//! - **Decision**: `DecisionEngine` with error classification, backoff and fallback
//! - **Narration**: bounded, drop-on-full commentary queue
//! - **Network**: `Session` with a single writer task, `bind_listener`
//! - **Error**: `PilotError` — typed, `thiserror`-based error hierarchy

pub mod capture;
pub mod codec;
pub mod decision;
pub mod error;
pub mod narration;
pub mod network;
pub mod protocol;
pub mod state;
pub mod video;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    create_backend, CaptureBackend, CaptureChain, CaptureConfig, CaptureFrame, EmulatorScreenshotCapture,
    EnhanceConfig, Region, ScreenCapture, VideoSegment,
};
pub use codec::EmulatorCodec;
pub use decision::{
    classify_error, DecisionEngine, DecisionOracle, DecisionOutcome, ErrorClass, FallbackConfig,
    FallbackPolicy, OracleRequest, OracleResponse, ProcessOracle, ProcessOracleConfig, RetryPolicy,
    TimingConfig, TimingModel,
};
pub use error::PilotError;
pub use narration::{LogNarrator, NarrationEvent, NarrationKind, NarrationQueue, Narrator};
pub use network::{bind_listener, ReadEvent, Session, SessionSender};
pub use protocol::{Button, ButtonAction, ButtonCommand, GameConfigScript, Inbound, Outbound, RawState};
pub use state::{Direction, GameState, GameStateTracker, MovementPattern, SessionPhase};
pub use video::{AnalyzerConfig, FramePayload, GifConfig, SegmentAnalysis, VideoAnalyzer};
