//! Domain-specific error types for the gbpilot control loop.
//!
//! Fallible plumbing returns `Result<T, PilotError>`. Decision-oracle
//! failures are deliberately *not* represented here: they surface as a
//! structured [`DecisionOutcome`](crate::decision::DecisionOutcome) so the
//! control loop never has to unwind on a bad decision.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for gbpilot.
#[derive(Debug, Error)]
pub enum PilotError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A line did not match any known message type.
    #[error("unknown message type: {0:?}")]
    UnknownMessage(String),

    /// A known message carried the wrong number of fields.
    #[error("malformed {kind} message: expected {expected} fields, got {actual}")]
    MalformedMessage {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A button command could not be decoded.
    #[error("invalid button command: {0}")]
    InvalidButtonCommand(String),

    /// A session phase transition was not allowed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Capture Errors ───────────────────────────────────────────
    /// The capture backend cannot produce frames right now.
    #[error("capture backend {0} unavailable")]
    CaptureUnavailable(&'static str),

    /// Grabbing or loading a frame failed.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Image decoding, encoding or resampling failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// A segment contained no frames where at least one was required.
    #[error("empty video segment")]
    EmptySegment,

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a JSON payload failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    // ── Application Errors ───────────────────────────────────────
    /// The configured oracle could not be invoked.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for PilotError {
    fn from(s: String) -> Self {
        PilotError::Other(s)
    }
}

impl From<&str> for PilotError {
    fn from(s: &str) -> Self {
        PilotError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PilotError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PilotError::ChannelClosed
    }
}

impl From<xcap::XCapError> for PilotError {
    fn from(e: xcap::XCapError) -> Self {
        PilotError::Capture(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = PilotError::MalformedMessage {
            kind: "screenshot_with_state",
            expected: 6,
            actual: 4,
        };
        let text = e.to_string();
        assert!(text.contains("screenshot_with_state"));
        assert!(text.contains('6'));
        assert!(text.contains('4'));

        let e = PilotError::CaptureUnavailable("screen");
        assert!(e.to_string().contains("screen"));
    }

    #[test]
    fn from_string() {
        let e: PilotError = "something broke".into();
        assert!(matches!(e, PilotError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: PilotError = io_err.into();
        assert!(matches!(e, PilotError::Connection(_)));
    }
}
