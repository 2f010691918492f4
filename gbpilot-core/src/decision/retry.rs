//! Oracle error classification and exponential backoff.
//!
//! | Class            | Matches                                   | Retried |
//! |------------------|-------------------------------------------|---------|
//! | `Connection`     | socket, connection, timeout, mgba         | yes     |
//! | `RetryableApi`   | rate limit, 429, 5xx, overloaded, temporary | yes   |
//! | `RetryableParse` | json, parse, malformed, empty response    | yes     |
//! | `NonRetryable`   | api key, auth, forbidden, 401/403         | no      |
//! | `Unknown`        | anything else                             | yes     |
//!
//! Non-retryable patterns are checked first so "invalid api key (timeout
//! while authenticating)" is not retried.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── ErrorClass ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Connection,
    RetryableApi,
    RetryableParse,
    NonRetryable,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::NonRetryable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::RetryableApi => "retryable_api",
            ErrorClass::RetryableParse => "retryable_parse",
            ErrorClass::NonRetryable => "non_retryable",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword table, checked top to bottom.
const CLASSIFICATION: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::NonRetryable,
        &[
            "api key",
            "api_key",
            "apikey",
            "unauthorized",
            "authentication",
            "permission denied",
            "forbidden",
            "401",
            "403",
            "invalid_request",
        ],
    ),
    (
        ErrorClass::RetryableApi,
        &[
            "rate limit",
            "rate_limit",
            "ratelimit",
            "too many requests",
            "429",
            "500",
            "502",
            "503",
            "504",
            "overloaded",
            "server error",
            "service unavailable",
            "temporar",
            "quota",
        ],
    ),
    (
        ErrorClass::Connection,
        &[
            "socket",
            "connection",
            "connect",
            "timeout",
            "timed out",
            "network",
            "broken pipe",
            "reset by peer",
            "mgba",
        ],
    ),
    (
        ErrorClass::RetryableParse,
        &[
            "json",
            "parse",
            "parsing",
            "malformed",
            "decode",
            "empty response",
            "no response",
            "unexpected end",
            "invalid response",
        ],
    ),
];

/// Classify an oracle error message.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    CLASSIFICATION
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map_or(ErrorClass::Unknown, |(class, _)| *class)
}

/// Whether an error message looks like the oracle refusing the image
/// payload (typically an animated GIF), independent of its class.
pub fn is_image_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["image", "gif", "media type", "mime", "unsupported format"]
        .iter()
        .any(|n| lower.contains(n))
}

// ── RetryPolicy ──────────────────────────────────────────────────

/// `delay(attempt) = min(base_delay × multiplier^attempt, max_delay)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first call.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Total calls allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

// ── RetryState ───────────────────────────────────────────────────

/// Per-engine retry bookkeeping.
///
/// `attempt` counts retries inside one decision and resets on success;
/// `consecutive_failures` counts whole decisions that ended in failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub last_class: Option<ErrorClass>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed call; returns the backoff to sleep before retrying,
    /// or `None` when the decision should give up.
    pub fn record_failure(&mut self, class: ErrorClass, error: &str, policy: &RetryPolicy) -> Option<Duration> {
        self.last_class = Some(class);
        self.last_error = Some(error.to_string());
        if !class.is_retryable() || self.attempt >= policy.max_retries {
            return None;
        }
        let delay = policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn record_success(&mut self) {
        self.attempt = 0;
        self.last_class = None;
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    /// Close out a decision that ended in failure.
    pub fn finish_failed(&mut self) {
        self.attempt = 0;
        self.consecutive_failures += 1;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            ("Rate limit exceeded", ErrorClass::RetryableApi),
            ("HTTP 503 Service Unavailable", ErrorClass::RetryableApi),
            ("temporary failure", ErrorClass::RetryableApi),
            ("socket closed", ErrorClass::Connection),
            ("request timed out", ErrorClass::Connection),
            ("mGBA not responding", ErrorClass::Connection),
            ("JSON decode error", ErrorClass::RetryableParse),
            ("empty response from model", ErrorClass::RetryableParse),
            ("invalid api key", ErrorClass::NonRetryable),
            ("403 Forbidden", ErrorClass::NonRetryable),
            ("the moon is in the wrong phase", ErrorClass::Unknown),
        ];
        for (msg, class) in cases {
            assert_eq!(classify_error(msg), class, "{msg}");
        }
    }

    #[test]
    fn auth_beats_connection_keywords() {
        assert_eq!(
            classify_error("invalid api key (timeout while authenticating)"),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn only_non_retryable_stops() {
        assert!(ErrorClass::Unknown.is_retryable());
        assert!(ErrorClass::RetryableParse.is_retryable());
        assert!(!ErrorClass::NonRetryable.is_retryable());
    }

    #[test]
    fn image_rejection_detection() {
        assert!(is_image_rejection("Could not process image"));
        assert!(is_image_rejection("unsupported GIF"));
        assert!(!is_image_rejection("rate limit"));
    }

    #[test]
    fn backoff_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_secs(2));
        assert_eq!(p.delay_for(1), Duration::from_secs(3));
        assert_eq!(p.delay_for(2), Duration::from_millis(4500));
        assert_eq!(p.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let p = RetryPolicy::default();
        let delays: Vec<_> = (0..20).map(|a| p.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[test]
    fn retry_state_gives_up_after_max() {
        let p = RetryPolicy::default();
        let mut s = RetryState::new();
        for _ in 0..3 {
            assert!(s.record_failure(ErrorClass::RetryableApi, "rate limit", &p).is_some());
        }
        assert!(s.record_failure(ErrorClass::RetryableApi, "rate limit", &p).is_none());
        s.finish_failed();
        assert_eq!(s.attempt, 0);
        assert_eq!(s.consecutive_failures, 1);
    }

    #[test]
    fn non_retryable_gives_up_immediately() {
        let mut s = RetryState::new();
        assert!(
            s.record_failure(ErrorClass::NonRetryable, "invalid api key", &RetryPolicy::default())
                .is_none()
        );
        assert_eq!(s.attempt, 0);
    }

    #[test]
    fn success_resets() {
        let p = RetryPolicy::default();
        let mut s = RetryState::new();
        s.record_failure(ErrorClass::Unknown, "?", &p);
        s.consecutive_failures = 2;
        s.record_success();
        assert_eq!(s, RetryState::default());
    }
}
