//! # gbpilot-server — emulator control service
//!
//! Listens for a single emulator script connection, configures it, then
//! runs the screenshot → decision → buttons loop against an external
//! decision oracle.
//!
//! ## Modes
//!
//! - **Screenshot**: the emulator sends a screenshot after each command.
//! - **Continuous**: frames are recorded while a command plays out and the
//!   clip is analyzed before the next decision (`capture.continuous_recording`).

pub mod config;
pub mod service;
