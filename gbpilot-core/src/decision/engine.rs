//! The decision engine: one oracle consultation with classification,
//! backoff and retries.
//!
//! ```text
//!          ┌────────── retryable, attempts left ──────────┐
//!          ▼                                               │
//! Idle ─► Calling ─► success ─► Success                     │
//!            │                                              │
//!            ├─► error ─► RetryableFailure ─► backoff sleep ┘
//!            │
//!            └─► non-retryable / exhausted ─► FatalFailure
//! ```
//!
//! An animated payload the oracle rejects is resent once as a static
//! first/last pair before the error is classified.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::decision::oracle::{DecisionOracle, OracleRequest};
use crate::decision::retry::{classify_error, is_image_rejection, ErrorClass, RetryPolicy, RetryState};
use crate::protocol::buttons::{Button, ButtonCommand};
use crate::state::GameState;
use crate::video::FramePayload;

/// Commands remembered for context and fallback.
pub const RECENT_ACTIONS_CAPACITY: usize = 10;

/// Longest long-term note kept, in characters.
pub const MAX_NOTE_CHARS: usize = 2000;

// ── Phase ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePhase {
    Idle,
    Calling { attempt: u32 },
    Success,
    RetryableFailure { class: ErrorClass, backoff: Duration },
    FatalFailure { class: ErrorClass },
}

// ── Outcome ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Success {
        command: ButtonCommand,
        text: String,
        /// Oracle calls made, including static-image retries.
        attempts: u32,
        /// The oracle returned no usable button and `A` was substituted.
        defaulted: bool,
    },
    /// Nothing must be pressed.
    Failed {
        class: ErrorClass,
        error: String,
        attempts: u32,
    },
}

impl DecisionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DecisionOutcome::Success { .. })
    }

    /// The command to dispatch. `None` on failure.
    pub fn command(&self) -> Option<&ButtonCommand> {
        match self {
            DecisionOutcome::Success { command, .. } => Some(command),
            DecisionOutcome::Failed { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DecisionOutcome::Success { attempts, .. } | DecisionOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct DecisionEngine {
    oracle: Arc<dyn DecisionOracle>,
    policy: RetryPolicy,
    retry: RetryState,
    phase: EnginePhase,
    note: Option<String>,
    recent: VecDeque<ButtonCommand>,
    last_was_fallback: bool,
}

impl DecisionEngine {
    pub fn new(oracle: Arc<dyn DecisionOracle>, policy: RetryPolicy) -> Self {
        Self {
            oracle,
            policy,
            retry: RetryState::new(),
            phase: EnginePhase::Idle,
            note: None,
            recent: VecDeque::with_capacity(RECENT_ACTIONS_CAPACITY),
            last_was_fallback: false,
        }
    }

    /// Swap the retry policy (configuration reload).
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn phase(&self) -> &EnginePhase {
        &self.phase
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.retry.consecutive_failures
    }

    pub fn last_was_fallback(&self) -> bool {
        self.last_was_fallback
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    /// Recently dispatched commands, oldest first.
    pub fn recent_actions(&self) -> impl Iterator<Item = &ButtonCommand> {
        self.recent.iter()
    }

    /// Remember a command chosen without the oracle.
    pub fn record_fallback(&mut self, command: &ButtonCommand) {
        self.remember(command.clone());
        self.last_was_fallback = true;
    }

    fn remember(&mut self, command: ButtonCommand) {
        if self.recent.len() == RECENT_ACTIONS_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(command);
    }

    /// Situation text plus the long-term note and recent actions.
    pub fn compose_context(&self, situation: &str) -> String {
        let mut out = situation.trim().to_string();
        if let Some(note) = &self.note {
            out.push_str("\n\nLong-term note: ");
            out.push_str(note);
        }
        if !self.recent.is_empty() {
            let recent: Vec<String> = self.recent.iter().map(ButtonCommand::describe).collect();
            out.push_str("\n\nRecent actions (oldest first): ");
            out.push_str(&recent.join(" | "));
        }
        out
    }

    /// Consult the oracle until it succeeds, fails fatally, or retries run
    /// out.
    pub async fn decide(
        &mut self,
        payload: &FramePayload,
        state: Option<&GameState>,
        situation: &str,
    ) -> DecisionOutcome {
        self.last_was_fallback = false;
        let context = self.compose_context(situation);
        let summary = state.map(GameState::summary).unwrap_or_default();

        let mut payload = payload.clone();
        let mut static_retry_used = false;
        let mut calls = 0u32;

        loop {
            self.phase = EnginePhase::Calling {
                attempt: self.retry.attempt,
            };

            let response = match OracleRequest::from_payload(&payload, state, summary.as_str(), context.as_str()) {
                Ok(request) => {
                    calls += 1;
                    debug!(
                        oracle = self.oracle.name(),
                        attempt = self.retry.attempt,
                        payload = payload.kind(),
                        "calling oracle"
                    );
                    self.oracle.decide(&request).await
                }
                Err(e) => {
                    warn!("could not encode oracle request: {e}");
                    return self.give_up(ErrorClass::NonRetryable, e.to_string(), calls);
                }
            };

            if response.success {
                return self.succeed(response.actions, response.durations, response.text, response.note, calls);
            }

            let error = response
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "oracle reported failure with no error".to_string());

            if !static_retry_used && is_image_rejection(&error) {
                if let Some(fallback) = payload.static_fallback() {
                    warn!(error = %error, "oracle rejected animated payload; retrying with static frames");
                    payload = fallback;
                    static_retry_used = true;
                    continue;
                }
            }

            let class = classify_error(&error);
            match self.retry.record_failure(class, &error, &self.policy) {
                Some(backoff) => {
                    self.phase = EnginePhase::RetryableFailure { class, backoff };
                    warn!(
                        %class,
                        error = %error,
                        retry = self.retry.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "oracle call failed; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                None => return self.give_up(class, error, calls),
            }
        }
    }

    fn succeed(
        &mut self,
        actions: Vec<String>,
        durations: Option<Vec<u32>>,
        text: String,
        note: Option<String>,
        attempts: u32,
    ) -> DecisionOutcome {
        self.retry.record_success();
        self.phase = EnginePhase::Success;

        if let Some(note) = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            debug!(chars = note.len(), "long-term note updated");
            self.note = Some(note.chars().take(MAX_NOTE_CHARS).collect());
        }

        let mut command = ButtonCommand::from_names(&actions, durations.as_deref());
        let defaulted = command.is_empty();
        if defaulted {
            info!(returned = ?actions, "oracle returned no valid buttons; pressing A");
            command = ButtonCommand::single(Button::A);
        } else if command.len() < actions.len() {
            warn!(returned = ?actions, kept = %command.describe(), "dropped invalid button names");
        }

        self.remember(command.clone());
        info!(buttons = %command.describe(), attempts, "decision made");
        DecisionOutcome::Success {
            command,
            text,
            attempts,
            defaulted,
        }
    }

    fn give_up(&mut self, class: ErrorClass, error: String, attempts: u32) -> DecisionOutcome {
        self.retry.finish_failed();
        self.phase = EnginePhase::FatalFailure { class };
        warn!(
            %class,
            error = %error,
            attempts,
            consecutive_failures = self.retry.consecutive_failures,
            "decision failed; no buttons will be pressed"
        );
        DecisionOutcome::Failed { class, error, attempts }
    }
}

// ── Tests ────────────────────────────────────────────────────────
