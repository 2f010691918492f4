//! Low-risk actions chosen without the oracle.
//!
//! Once decisions have failed several times in a row, the control loop
//! stops asking the oracle every cycle and alternates: one fallback action,
//! then one oracle attempt. Two separate "stuck" signals drive the choice:
//!
//! 1. the same single button pressed three times running (input repeat);
//! 2. the tracker reporting no positional progress (stuck/oscillating).
//!
//! They are checked in that order and never merged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::buttons::{Button, ButtonAction, ButtonCommand};
use crate::state::{Direction, MovementPattern};

/// Roughly one tile of walking.
pub const NUDGE_FRAMES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Consecutive failed decisions before fallback kicks in.
    pub failure_threshold: u32,
    /// Identical single presses that count as an input repeat.
    pub repeat_window: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            repeat_window: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The same button was pressed `repeat_window` times.
    RepeatedInput(Button),
    /// The tracker saw no positional progress.
    NoProgress(MovementPattern),
    /// Nothing suspicious; press the default button.
    Default,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::RepeatedInput(b) => write!(f, "{b} pressed repeatedly"),
            FallbackReason::NoProgress(p) => write!(f, "no progress ({p:?})"),
            FallbackReason::Default => f.write_str("default action"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChoice {
    pub command: ButtonCommand,
    pub reason: FallbackReason,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    config: FallbackConfig,
}

impl FallbackPolicy {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    /// Whether this cycle should skip the oracle.
    ///
    /// `last_was_fallback` makes fallback and oracle attempts alternate so a
    /// recovered oracle is noticed.
    pub fn applies(&self, consecutive_failures: u32, last_was_fallback: bool) -> bool {
        consecutive_failures >= self.config.failure_threshold && !last_was_fallback
    }

    /// Pick an action. `recent` is oldest first.
    pub fn choose<'a>(
        &self,
        recent: impl IntoIterator<Item = &'a ButtonCommand>,
        pattern: MovementPattern,
        facing: Direction,
    ) -> FallbackChoice {
        if let Some(repeated) = self.repeated_button(recent) {
            let next = if repeated.is_directional() {
                rotate(repeated)
            } else {
                direction_button(facing).map_or(Button::Down, rotate)
            };
            return nudge(next, FallbackReason::RepeatedInput(repeated));
        }

        if pattern.is_no_progress() {
            let next = direction_button(facing).map_or(Button::Up, rotate);
            return nudge(next, FallbackReason::NoProgress(pattern));
        }

        FallbackChoice {
            command: ButtonCommand::single(Button::A),
            reason: FallbackReason::Default,
        }
    }

    /// The button pressed alone in each of the last `repeat_window`
    /// commands, if they all agree.
    fn repeated_button<'a>(&self, recent: impl IntoIterator<Item = &'a ButtonCommand>) -> Option<Button> {
        let window = self.config.repeat_window.max(1);
        let recent: Vec<&ButtonCommand> = recent.into_iter().collect();
        if recent.len() < window {
            return None;
        }
        let mut tail = recent[recent.len() - window..].iter().map(|cmd| {
            let mut buttons = cmd.buttons();
            match (buttons.next(), buttons.next()) {
                (Some(b), None) => Some(b),
                _ => None,
            }
        });
        let first = tail.next()??;
        tail.all(|b| b == Some(first)).then_some(first)
    }
}

fn nudge(button: Button, reason: FallbackReason) -> FallbackChoice {
    FallbackChoice {
        command: ButtonCommand::new(vec![ButtonAction::new(button, NUDGE_FRAMES)]),
        reason,
    }
}

/// Clockwise quarter turn.
fn rotate(button: Button) -> Button {
    match button {
        Button::Up => Button::Right,
        Button::Right => Button::Down,
        Button::Down => Button::Left,
        Button::Left => Button::Up,
        other => other,
    }
}

fn direction_button(direction: Direction) -> Option<Button> {
    match direction {
        Direction::Up => Some(Button::Up),
        Direction::Down => Some(Button::Down),
        Direction::Left => Some(Button::Left),
        Direction::Right => Some(Button::Right),
        Direction::Unknown => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cmds(buttons: &[Button]) -> Vec<ButtonCommand> {
        buttons.iter().map(|b| ButtonCommand::single(*b)).collect()
    }

    #[test]
    fn alternates_with_oracle_attempts() {
        let p = FallbackPolicy::default();
        assert!(!p.applies(2, false));
        assert!(p.applies(3, false));
        assert!(!p.applies(3, true));
    }

    #[test]
    fn repeated_direction_turns() {
        let p = FallbackPolicy::default();
        let recent = cmds(&[Button::A, Button::Left, Button::Left, Button::Left]);
        let choice = p.choose(&recent, MovementPattern::Moving, Direction::Left);
        assert_eq!(choice.reason, FallbackReason::RepeatedInput(Button::Left));
        assert_eq!(choice.command.buttons().collect::<Vec<_>>(), vec![Button::Up]);
        assert_eq!(choice.command.actions()[0].frames as u32, NUDGE_FRAMES);
    }

    #[test]
    fn repeated_a_nudges_perpendicular_to_facing() {
        let p = FallbackPolicy::default();
        let recent = cmds(&[Button::A, Button::A, Button::A]);
        let choice = p.choose(&recent, MovementPattern::Moving, Direction::Up);
        assert_eq!(choice.command.buttons().collect::<Vec<_>>(), vec![Button::Right]);
    }

    #[test]
    fn stuck_nudges_perpendicular() {
        let p = FallbackPolicy::default();
        let recent = cmds(&[Button::A, Button::B, Button::A]);
        let choice = p.choose(&recent, MovementPattern::Stuck, Direction::Down);
        assert_eq!(choice.reason, FallbackReason::NoProgress(MovementPattern::Stuck));
        assert_eq!(choice.command.buttons().collect::<Vec<_>>(), vec![Button::Left]);
    }

    #[test]
    fn multi_button_commands_are_not_repeats() {
        let p = FallbackPolicy::default();
        let recent = vec![ButtonCommand::from_names(&["UP", "A"], None); 3];
        let choice = p.choose(&recent, MovementPattern::Moving, Direction::Unknown);
        assert_eq!(choice.reason, FallbackReason::Default);
        assert_eq!(choice.command, ButtonCommand::single(Button::A));
    }

    #[test]
    fn short_history_uses_default() {
        let p = FallbackPolicy::default();
        let recent = cmds(&[Button::Up, Button::Up]);
        let choice = p.choose(&recent, MovementPattern::Moving, Direction::Up);
        assert_eq!(choice.reason, FallbackReason::Default);
    }
}
