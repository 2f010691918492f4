//! Button model and the `code,code|duration,duration` command encoding.
//!
//! # Wire Format
//!
//! ```text
//! 6,0|2,2
//! │ │ └─┴── per-button hold duration in frames (60 fps)
//! └─┴────── button codes, pressed in order
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PilotError;

/// Default hold duration in frames when the oracle gives none.
pub const DEFAULT_BUTTON_FRAMES: u8 = 2;

/// Shortest hold the emulator script accepts.
pub const MIN_BUTTON_FRAMES: u8 = 1;

/// Longest hold (three seconds at 60 fps).
pub const MAX_BUTTON_FRAMES: u8 = 180;

// ── Button ───────────────────────────────────────────────────────

/// One of the ten Game Boy Advance buttons, with its wire code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Button {
    A = 0,
    B = 1,
    Select = 2,
    Start = 3,
    Right = 4,
    Left = 5,
    Up = 6,
    Down = 7,
    R = 8,
    L = 9,
}

impl Button {
    /// Every button, in wire-code order.
    pub const ALL: [Button; 10] = [
        Button::A,
        Button::B,
        Button::Select,
        Button::Start,
        Button::Right,
        Button::Left,
        Button::Up,
        Button::Down,
        Button::R,
        Button::L,
    ];

    /// Parse a button name as returned by the oracle (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
    }

    /// Map a wire code back to a button.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Wire code sent to the emulator.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Canonical upper-case name.
    pub const fn name(self) -> &'static str {
        match self {
            Button::A => "A",
            Button::B => "B",
            Button::Select => "SELECT",
            Button::Start => "START",
            Button::Right => "RIGHT",
            Button::Left => "LEFT",
            Button::Up => "UP",
            Button::Down => "DOWN",
            Button::R => "R",
            Button::L => "L",
        }
    }

    /// D-pad buttons move the character and need longer settle time.
    pub const fn is_directional(self) -> bool {
        matches!(
            self,
            Button::Up | Button::Down | Button::Left | Button::Right
        )
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── ButtonAction ─────────────────────────────────────────────────

/// A single press: which button and for how many frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonAction {
    pub button: Button,
    pub frames: u8,
}

impl ButtonAction {
    /// Build an action, clamping `frames` into `[1, 180]`.
    pub fn new(button: Button, frames: u32) -> Self {
        let frames = frames.clamp(MIN_BUTTON_FRAMES as u32, MAX_BUTTON_FRAMES as u32) as u8;
        Self { button, frames }
    }

    /// Action with the default two-frame hold.
    pub fn tap(button: Button) -> Self {
        Self {
            button,
            frames: DEFAULT_BUTTON_FRAMES,
        }
    }
}

// ── ButtonCommand ────────────────────────────────────────────────

/// An ordered sequence of presses sent as one wire message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ButtonCommand {
    actions: Vec<ButtonAction>,
}

impl ButtonCommand {
    /// Wrap already-validated actions.
    pub fn new(actions: Vec<ButtonAction>) -> Self {
        Self { actions }
    }

    /// Single press of `button` with the default duration.
    pub fn single(button: Button) -> Self {
        Self::new(vec![ButtonAction::tap(button)])
    }

    /// Build from oracle output.
    ///
    /// Names outside the ten-button set are dropped, never substituted.
    /// Durations are paired positionally with the *original* name list,
    /// clamped into `[1, 180]`, and padded with the two-frame default.
    pub fn from_names<S: AsRef<str>>(names: &[S], durations: Option<&[u32]>) -> Self {
        let actions = names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let button = Button::from_name(name.as_ref())?;
                let frames = durations
                    .and_then(|d| d.get(i).copied())
                    .unwrap_or(DEFAULT_BUTTON_FRAMES as u32);
                Some(ButtonAction::new(button, frames))
            })
            .collect();
        Self { actions }
    }

    /// Decode the wire representation (`6,0|2,2`).
    ///
    /// A missing duration list is allowed; every press then gets the default.
    pub fn parse(wire: &str) -> Result<Self, PilotError> {
        let wire = wire.trim();
        let (codes, durations) = match wire.split_once('|') {
            Some((c, d)) => (c, Some(d)),
            None => (wire, None),
        };

        let mut buttons = Vec::new();
        for code in codes.split(',').filter(|s| !s.trim().is_empty()) {
            let code: u8 = code
                .trim()
                .parse()
                .map_err(|_| PilotError::InvalidButtonCommand(format!("bad code {code:?}")))?;
            let button = Button::from_code(code)
                .ok_or_else(|| PilotError::InvalidButtonCommand(format!("unknown code {code}")))?;
            buttons.push(button);
        }

        let mut frames = Vec::new();
        if let Some(durations) = durations {
            for d in durations.split(',').filter(|s| !s.trim().is_empty()) {
                let d: u32 = d.trim().parse().map_err(|_| {
                    PilotError::InvalidButtonCommand(format!("bad duration {d:?}"))
                })?;
                frames.push(d);
            }
        }

        let actions = buttons
            .into_iter()
            .enumerate()
            .map(|(i, b)| {
                ButtonAction::new(b, frames.get(i).copied().unwrap_or(DEFAULT_BUTTON_FRAMES as u32))
            })
            .collect();
        Ok(Self { actions })
    }

    /// Encode for the wire, without the trailing newline.
    pub fn encode(&self) -> String {
        let codes: Vec<String> = self
            .actions
            .iter()
            .map(|a| a.button.code().to_string())
            .collect();
        let frames: Vec<String> = self.actions.iter().map(|a| a.frames.to_string()).collect();
        format!("{}|{}", codes.join(","), frames.join(","))
    }

    pub fn actions(&self) -> &[ButtonAction] {
        &self.actions
    }

    pub fn buttons(&self) -> impl Iterator<Item = Button> + '_ {
        self.actions.iter().map(|a| a.button)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Sum of all hold durations in frames.
    pub fn total_frames(&self) -> u32 {
        self.actions.iter().map(|a| a.frames as u32).sum()
    }

    /// Human-readable `UP(2) A(2)` rendering for logs and context.
    pub fn describe(&self) -> String {
        self.actions
            .iter()
            .map(|a| format!("{}({})", a.button, a.frames))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ButtonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_emulator_script() {
        assert_eq!(Button::A.code(), 0);
        assert_eq!(Button::B.code(), 1);
        assert_eq!(Button::Select.code(), 2);
        assert_eq!(Button::Start.code(), 3);
        assert_eq!(Button::Right.code(), 4);
        assert_eq!(Button::Left.code(), 5);
        assert_eq!(Button::Up.code(), 6);
        assert_eq!(Button::Down.code(), 7);
        assert_eq!(Button::R.code(), 8);
        assert_eq!(Button::L.code(), 9);
    }

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(Button::from_name("up"), Some(Button::Up));
        assert_eq!(Button::from_name(" Start "), Some(Button::Start));
        assert_eq!(Button::from_name("JUMP"), None);
    }

    #[test]
    fn encode_then_parse_keeps_pairs() {
        let names = ["UP", "A", "select", "L"];
        let cmd = ButtonCommand::from_names(&names, Some(&[10, 2, 30, 180]));
        let wire = cmd.encode();
        assert_eq!(wire, "6,0,2,9|10,2,30,180");

        let decoded = ButtonCommand::parse(&wire).unwrap();
        let pairs: Vec<(&str, u8)> = decoded
            .actions()
            .iter()
            .map(|a| (a.button.name(), a.frames))
            .collect();
        assert_eq!(
            pairs,
            vec![("UP", 10), ("A", 2), ("SELECT", 30), ("L", 180)]
        );
    }

    #[test]
    fn invalid_names_are_dropped_not_substituted() {
        let cmd = ButtonCommand::from_names(&["UP", "JUMP", "B"], None);
        let buttons: Vec<Button> = cmd.buttons().collect();
        assert_eq!(buttons, vec![Button::Up, Button::B]);
    }

    #[test]
    fn durations_are_clamped_and_padded() {
        let cmd = ButtonCommand::from_names(&["UP", "DOWN", "A"], Some(&[0, 500]));
        let frames: Vec<u8> = cmd.actions().iter().map(|a| a.frames).collect();
        assert_eq!(frames, vec![1, 180, 2]);
    }

    #[test]
    fn parse_without_durations_uses_default() {
        let cmd = ButtonCommand::parse("4,5").unwrap();
        assert_eq!(cmd.len(), 2);
        assert!(cmd.actions().iter().all(|a| a.frames == DEFAULT_BUTTON_FRAMES));
    }

    #[test]
    fn parse_rejects_unknown_code() {
        assert!(ButtonCommand::parse("12|2").is_err());
        assert!(ButtonCommand::parse("x|2").is_err());
    }

    #[test]
    fn total_frames_and_describe() {
        let cmd = ButtonCommand::from_names(&["UP", "A"], Some(&[4, 6]));
        assert_eq!(cmd.total_frames(), 10);
        assert_eq!(cmd.describe(), "UP(4) A(6)");
    }
}
