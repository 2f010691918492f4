//! Game state parsing, position tracking and the session state machine.

pub mod connection;
pub mod game;
pub mod tracker;

pub use connection::SessionPhase;
pub use game::{Direction, GameState, ParsedState};
pub use tracker::{
    GameStateTracker, MapTransition, MovementPattern, PositionEntry, PositionHistory,
    TrackerUpdate, HISTORY_CAPACITY,
};
