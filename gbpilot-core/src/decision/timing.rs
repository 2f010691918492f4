//! Action timing.
//!
//! Two independent formulas:
//!
//! * **Settle wait**: how long to pause after dispatching a command before
//!   capturing again. `base + Σ per-action wait + cooldown`, capped at
//!   `safety_max`.
//! * **Recording window**: how long the emulator needs to play a command
//!   back, `(Σ frames + separation × (n − 1) + post_wait) / 60` seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::buttons::ButtonCommand;

/// Emulator frame rate.
pub const FRAMES_PER_SECOND: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Fixed settle time after any command.
    pub stabilization_base: Duration,
    /// Extra wait per directional press (walking animations).
    pub movement_wait: Duration,
    /// Extra wait per menu or interaction press.
    pub interaction_wait: Duration,
    /// Decision cooldown appended after everything else.
    pub cooldown: Duration,
    /// Upper bound on the whole settle wait.
    pub safety_max: Duration,
    /// Frames the emulator script leaves between two presses.
    pub separation_frames: u32,
    /// Frames the emulator script waits after the last press.
    pub post_wait_frames: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stabilization_base: Duration::from_millis(500),
            movement_wait: Duration::from_millis(300),
            interaction_wait: Duration::from_millis(150),
            cooldown: Duration::from_secs(1),
            safety_max: Duration::from_secs(10),
            separation_frames: 58,
            post_wait_frames: 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimingModel {
    config: TimingConfig,
}

impl TimingModel {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Pause before the next capture.
    pub fn settle_wait(&self, command: &ButtonCommand) -> Duration {
        let per_action: Duration = command
            .actions()
            .iter()
            .map(|a| {
                let kind = if a.button.is_directional() {
                    self.config.movement_wait
                } else {
                    self.config.interaction_wait
                };
                kind + frames_to_duration(a.frames as u32)
            })
            .sum();
        (self.config.stabilization_base + per_action + self.config.cooldown).min(self.config.safety_max)
    }

    /// Frames the emulator spends playing `command` back.
    pub fn expected_recording_frames(&self, command: &ButtonCommand) -> u32 {
        if command.is_empty() {
            return self.config.post_wait_frames;
        }
        let gaps = command.len() as u32 - 1;
        command.total_frames() + self.config.separation_frames * gaps + self.config.post_wait_frames
    }

    /// Recording window for `command`.
    pub fn expected_recording_duration(&self, command: &ButtonCommand) -> Duration {
        frames_to_duration(self.expected_recording_frames(command))
    }
}

pub fn frames_to_duration(frames: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / FRAMES_PER_SECOND)
}

// ── Tests ────────────────────────────────────────────────────────
