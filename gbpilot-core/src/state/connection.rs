//! Emulator session state machine.
//!
//! Provides a `SessionPhase` enum that models the lifecycle of one
//! emulator connection, with validated transitions that return
//! `Result` instead of panicking.

use std::time::Instant;

use crate::error::PilotError;

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of an emulator session.
///
/// ```text
///  Disconnected ──► AwaitingReady ──► ConfigSent ──► Playing
///       ▲                 │               ▲   │         │
///       │                 │               └───┼─────────┘ (script reload)
///       │                 ▼                   ▼         ▼
///       └──────────── Disconnecting ◄─────────┴─────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// Socket accepted; waiting for the script's `ready`.
    AwaitingReady,

    /// `game_config` sent; waiting for `config_loaded`.
    ConfigSent,

    /// Configuration acknowledged; the decision loop is running.
    Playing {
        /// When the session entered the `Playing` state.
        since: Instant,
    },

    /// Teardown in progress.
    Disconnecting,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::AwaitingReady => write!(f, "AwaitingReady"),
            Self::ConfigSent => write!(f, "ConfigSent"),
            Self::Playing { .. } => write!(f, "Playing"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl SessionPhase {
    /// Returns `true` once the emulator has loaded the configuration.
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the session has been playing, `None` in any other phase.
    pub fn playing_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Playing { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn accept(&mut self) -> Result<(), PilotError> {
        match self {
            Self::Disconnected => {
                *self = Self::AwaitingReady;
                Ok(())
            }
            _ => Err(PilotError::ProtocolViolation(
                "cannot accept: session already active",
            )),
        }
    }

    /// Record that `game_config` was sent.
    ///
    /// Valid from: `AwaitingReady`, `ConfigSent`, `Playing` (the script
    /// re-announces `ready` after a reload).
    pub fn config_sent(&mut self) -> Result<(), PilotError> {
        match self {
            Self::AwaitingReady | Self::ConfigSent | Self::Playing { .. } => {
                *self = Self::ConfigSent;
                Ok(())
            }
            _ => Err(PilotError::ProtocolViolation(
                "cannot send config: session not connected",
            )),
        }
    }

    /// Valid from: `ConfigSent`.
    pub fn config_loaded(&mut self) -> Result<(), PilotError> {
        match self {
            Self::ConfigSent => {
                *self = Self::Playing {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(PilotError::ProtocolViolation(
                "config_loaded without a pending game_config",
            )),
        }
    }

    /// Valid from: `AwaitingReady`, `ConfigSent`, `Playing`.
    pub fn begin_disconnect(&mut self) -> Result<(), PilotError> {
        match self {
            Self::AwaitingReady | Self::ConfigSent | Self::Playing { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(PilotError::ProtocolViolation(
                "cannot disconnect: session not active",
            )),
        }
    }

    /// Valid from: `Disconnecting`.
    pub fn finish_disconnect(&mut self) -> Result<(), PilotError> {
        match self {
            Self::Disconnecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(PilotError::ProtocolViolation(
                "cannot finish disconnect: not disconnecting",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Used on I/O failure mid-stream.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::Disconnected;

        phase.accept().unwrap();
        assert_eq!(phase, SessionPhase::AwaitingReady);

        phase.config_sent().unwrap();
        assert_eq!(phase, SessionPhase::ConfigSent);

        phase.config_loaded().unwrap();
        assert!(phase.is_playing());
        assert!(phase.playing_duration().is_some());

        phase.begin_disconnect().unwrap();
        assert_eq!(phase, SessionPhase::Disconnecting);

        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn ready_again_while_playing_resends_config() {
        let mut phase = SessionPhase::Playing {
            since: Instant::now(),
        };
        phase.config_sent().unwrap();
        assert_eq!(phase, SessionPhase::ConfigSent);
    }

    #[test]
    fn config_loaded_requires_pending_config() {
        let mut phase = SessionPhase::AwaitingReady;
        assert!(phase.config_loaded().is_err());
    }

    #[test]
    fn accept_twice_is_rejected() {
        let mut phase = SessionPhase::AwaitingReady;
        assert!(phase.accept().is_err());
    }

    #[test]
    fn force_disconnect_from_any_state() {
        let mut phase = SessionPhase::Playing {
            since: Instant::now(),
        };
        phase.force_disconnect();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionPhase::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionPhase::AwaitingReady.to_string(), "AwaitingReady");
        assert_eq!(SessionPhase::ConfigSent.to_string(), "ConfigSent");
        assert_eq!(
            SessionPhase::Playing {
                since: Instant::now()
            }
            .to_string(),
            "Playing"
        );
    }
}
