//! Position history and movement-pattern detection.
//!
//! The tracker keeps the last [`HISTORY_CAPACITY`] positions and flags two
//! no-progress patterns:
//!
//! - **stuck**: the last three positions are identical;
//! - **oscillating**: the recent window alternates between exactly two
//!   positions, revisiting one it already left.
//!
//! It also reports map-id changes between consecutive states.

use std::collections::VecDeque;
use std::time::SystemTime;

use crate::state::game::{Direction, GameState};

/// Number of positions retained.
pub const HISTORY_CAPACITY: usize = 10;

/// Identical trailing positions needed to call the player stuck.
pub const STUCK_WINDOW: usize = 3;

/// Trailing positions inspected for oscillation.
const OSCILLATION_WINDOW: usize = 6;

// ── PositionHistory ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEntry {
    pub x: i32,
    pub y: i32,
    pub direction: Direction,
    pub map_id: i32,
    pub timestamp: SystemTime,
}

impl PositionEntry {
    fn key(&self) -> (i32, i32, i32) {
        (self.x, self.y, self.map_id)
    }
}

/// Ring buffer of recent positions, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct PositionHistory {
    entries: VecDeque<PositionEntry>,
}

impl PositionHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn push(&mut self, state: &GameState) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(PositionEntry {
            x: state.x,
            y: state.y,
            direction: state.direction,
            map_id: state.map_id,
            timestamp: SystemTime::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Classify the recent movement.
    pub fn pattern(&self) -> MovementPattern {
        if self.is_stuck() {
            MovementPattern::Stuck
        } else if self.is_oscillating() {
            MovementPattern::Oscillating
        } else {
            MovementPattern::Moving
        }
    }

    fn is_stuck(&self) -> bool {
        if self.entries.len() < STUCK_WINDOW {
            return false;
        }
        let mut tail = self.entries.iter().rev().take(STUCK_WINDOW).map(|e| e.key());
        let first = tail.next();
        tail.all(|k| Some(k) == first)
    }

    fn is_oscillating(&self) -> bool {
        let window: Vec<_> = self
            .entries
            .iter()
            .rev()
            .take(OSCILLATION_WINDOW)
            .map(|e| e.key())
            .collect();
        if window.len() < 3 {
            return false;
        }

        let mut distinct = window.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != 2 {
            return false;
        }

        // Two transitions means a position was left and then returned to.
        let transitions = window.windows(2).filter(|w| w[0] != w[1]).count();
        transitions >= 2
    }
}

// ── Tracker ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementPattern {
    Moving,
    Stuck,
    Oscillating,
}

impl MovementPattern {
    pub fn is_no_progress(self) -> bool {
        !matches!(self, MovementPattern::Moving)
    }
}

/// Emitted when consecutive states report different map ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapTransition {
    pub from: i32,
    pub to: i32,
}

/// What changed after one state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub pattern: MovementPattern,
    pub map_transition: Option<MapTransition>,
}

/// Holds the latest [`GameState`] and its position history.
#[derive(Debug, Clone, Default)]
pub struct GameStateTracker {
    current: Option<GameState>,
    history: PositionHistory,
}

impl GameStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot and append it to the history.
    pub fn update(&mut self, state: GameState) -> TrackerUpdate {
        let map_transition = match self.current {
            Some(prev) if prev.map_id != state.map_id => Some(MapTransition {
                from: prev.map_id,
                to: state.map_id,
            }),
            _ => None,
        };
        self.current = Some(state);
        self.history.push(&state);
        TrackerUpdate {
            pattern: self.history.pattern(),
            map_transition,
        }
    }

    pub fn current(&self) -> Option<&GameState> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    pub fn pattern(&self) -> MovementPattern {
        self.history.pattern()
    }

    /// Situational notes for the oracle context.
    pub fn summary(&self) -> String {
        let Some(state) = self.current else {
            return "no state reported yet".to_string();
        };
        let mut out = format!("Player is on {}.", state.summary());
        match self.history.pattern() {
            MovementPattern::Stuck => out.push_str(
                " The position has not changed for several turns; try a different direction or interact.",
            ),
            MovementPattern::Oscillating => out.push_str(
                " The player is moving back and forth between two tiles; pick a new route.",
            ),
            MovementPattern::Moving => {}
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────
