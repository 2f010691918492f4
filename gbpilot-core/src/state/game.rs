//! Typed game state parsed from the emulator's scalar fields.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::protocol::RawState;

// ── Direction ────────────────────────────────────────────────────

/// Facing direction of the player character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    #[default]
    Unknown,
}

impl Direction {
    /// Offset of the alternate encoding some ROM hacks expose
    /// (`121..=124` instead of `1..=4`).
    const ALT_OFFSET: i64 = 120;

    /// Normalize any of the known encodings.
    ///
    /// Accepts the game's own codes (`1` down, `2` up, `3` left, `4` right),
    /// the same order shifted by 120, and literal names. Anything else maps
    /// to [`Direction::Unknown`].
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(code) = raw.parse::<i64>() {
            let code = if code > Self::ALT_OFFSET {
                code - Self::ALT_OFFSET
            } else {
                code
            };
            return match code {
                1 => Direction::Down,
                2 => Direction::Up,
                3 => Direction::Left,
                4 => Direction::Right,
                _ => Direction::Unknown,
            };
        }
        match raw.to_ascii_uppercase().as_str() {
            "UP" => Direction::Up,
            "DOWN" => Direction::Down,
            "LEFT" => Direction::Left,
            "RIGHT" => Direction::Right,
            _ => Direction::Unknown,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
            Direction::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── GameState ────────────────────────────────────────────────────

/// Snapshot of what the emulator reported about the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GameState {
    pub direction: Direction,
    pub x: i32,
    pub y: i32,
    pub map_id: i32,
}

/// Result of parsing a [`RawState`]: the state plus the names of any
/// numeric fields that fell back to `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedState {
    pub state: GameState,
    pub invalid_fields: Vec<&'static str>,
}

impl ParsedState {
    pub fn is_clean(&self) -> bool {
        self.invalid_fields.is_empty()
    }
}

impl GameState {
    pub fn new(direction: Direction, x: i32, y: i32, map_id: i32) -> Self {
        Self {
            direction,
            x,
            y,
            map_id,
        }
    }

    /// Parse the raw protocol fields. Never fails: bad numbers become `0`
    /// and are listed in [`ParsedState::invalid_fields`].
    pub fn from_raw(raw: &RawState) -> ParsedState {
        let mut invalid_fields = Vec::new();
        let mut number = |name: &'static str, value: &str| -> i32 {
            value.trim().parse::<i32>().unwrap_or_else(|_| {
                warn!(field = name, value, "non-numeric state field; using 0");
                invalid_fields.push(name);
                0
            })
        };
        let x = number("x", &raw.x);
        let y = number("y", &raw.y);
        let map_id = number("map_id", &raw.map_id);

        ParsedState {
            state: GameState {
                direction: Direction::parse(&raw.direction),
                x,
                y,
                map_id,
            },
            invalid_fields,
        }
    }

    /// Position key ignoring facing direction.
    pub fn position(&self) -> (i32, i32, i32) {
        (self.x, self.y, self.map_id)
    }

    /// One-line summary used in oracle context.
    pub fn summary(&self) -> String {
        format!(
            "map {} at ({}, {}) facing {}",
            self.map_id, self.x, self.y, self.direction
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(direction: &str, x: &str, y: &str, map_id: &str) -> RawState {
        RawState {
            direction: direction.into(),
            x: x.into(),
            y: y.into(),
            map_id: map_id.into(),
        }
    }

    #[test]
    fn direction_standard_codes() {
        assert_eq!(Direction::parse("1"), Direction::Down);
        assert_eq!(Direction::parse("2"), Direction::Up);
        assert_eq!(Direction::parse("3"), Direction::Left);
        assert_eq!(Direction::parse("4"), Direction::Right);
    }

    #[test]
    fn direction_alternate_codes() {
        assert_eq!(Direction::parse("121"), Direction::Down);
        assert_eq!(Direction::parse("122"), Direction::Up);
        assert_eq!(Direction::parse("123"), Direction::Left);
        assert_eq!(Direction::parse("124"), Direction::Right);
    }

    #[test]
    fn direction_literals_and_unknown() {
        assert_eq!(Direction::parse("up"), Direction::Up);
        assert_eq!(Direction::parse(" LEFT "), Direction::Left);
        assert_eq!(Direction::parse("0"), Direction::Unknown);
        assert_eq!(Direction::parse("125"), Direction::Unknown);
        assert_eq!(Direction::parse("north"), Direction::Unknown);
        assert_eq!(Direction::parse(""), Direction::Unknown);
    }

    #[test]
    fn parses_clean_state() {
        let parsed = GameState::from_raw(&raw("2", "10", "-3", "5"));
        assert!(parsed.is_clean());
        assert_eq!(parsed.state, GameState::new(Direction::Up, 10, -3, 5));
    }

    #[test]
    fn non_numeric_x_falls_back_to_zero() {
        let parsed = GameState::from_raw(&raw("1", "abc", "7", "3"));
        assert_eq!(parsed.state.x, 0);
        assert_eq!(parsed.state.y, 7);
        assert_eq!(parsed.invalid_fields, vec!["x"]);
    }

    #[test]
    fn summary_mentions_position() {
        let s = GameState::new(Direction::Left, 4, 9, 12).summary();
        assert_eq!(s, "map 12 at (4, 9) facing LEFT");
    }
}
