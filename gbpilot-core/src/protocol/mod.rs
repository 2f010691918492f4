//! Emulator protocol messages.
//!
//! Every message is one UTF-8 line; fields are `||`-separated.
//!
//! # Inbound (emulator → service)
//! ```text
//! ready
//! config_loaded
//! config_error||<msg>
//! screenshot_with_state||path||direction||x||y||mapId
//! enhanced_screenshot_with_state||path||prevPath||direction||x||y||mapId||buttonCount
//! state||direction||x||y||mapId
//! ```
//!
//! # Outbound (service → emulator)
//! ```text
//! request_screenshot
//! request_state
//! game_config||<lua-table-literal>
//! <code,code,...>|<duration,duration,...>
//! ```

pub mod buttons;

use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::error::PilotError;

pub use buttons::{
    Button, ButtonAction, ButtonCommand, DEFAULT_BUTTON_FRAMES, MAX_BUTTON_FRAMES,
    MIN_BUTTON_FRAMES,
};

/// Field separator within a message.
pub const FIELD_SEPARATOR: &str = "||";

const SCREENSHOT_FIELDS: usize = 6;
const ENHANCED_SCREENSHOT_FIELDS: usize = 8;
const STATE_FIELDS: usize = 5;

// ── RawState ─────────────────────────────────────────────────────

/// The four scalar state fields exactly as the emulator sent them.
///
/// Parsing into a typed [`GameState`](crate::state::GameState) is the
/// tracker's job so that bad numbers degrade instead of dropping the line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawState {
    pub direction: String,
    pub x: String,
    pub y: String,
    pub map_id: String,
}

impl RawState {
    fn from_fields(fields: &[&str]) -> Self {
        Self {
            direction: fields[0].trim().to_string(),
            x: fields[1].trim().to_string(),
            y: fields[2].trim().to_string(),
            map_id: fields[3].trim().to_string(),
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────

/// A screenshot report: where the emulator wrote the frame, plus state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotReport {
    pub path: PathBuf,
    pub state: RawState,
}

/// A screenshot report that also carries the frame from before the last
/// button sequence and how many buttons the emulator executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedScreenshotReport {
    pub path: PathBuf,
    pub previous_path: PathBuf,
    pub state: RawState,
    /// `None` when the emulator sent a non-numeric count.
    pub button_count: Option<u32>,
}

/// Messages received from the emulator script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ready,
    ConfigLoaded,
    ConfigError(String),
    Screenshot(ScreenshotReport),
    EnhancedScreenshot(EnhancedScreenshotReport),
    /// State-only update used in continuous-recording mode.
    State(RawState),
}

impl Inbound {
    /// Parse one line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, PilotError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();

        match fields[0].trim() {
            "ready" => Ok(Inbound::Ready),
            "config_loaded" => Ok(Inbound::ConfigLoaded),
            "config_error" => Ok(Inbound::ConfigError(
                fields[1..].join(FIELD_SEPARATOR).trim().to_string(),
            )),
            "screenshot_with_state" => Self::parse_screenshot(&fields),
            "enhanced_screenshot_with_state" => Self::parse_enhanced(&fields),
            "state" => {
                expect_fields("state", &fields, STATE_FIELDS)?;
                Ok(Inbound::State(RawState::from_fields(&fields[1..])))
            }
            _ if line.contains(FIELD_SEPARATOR) && fields.len() >= SCREENSHOT_FIELDS => {
                // The emulator occasionally splits a line so its prefix is
                // mangled; the payload layout is still a screenshot report.
                warn!(
                    prefix = fields[0],
                    fields = fields.len(),
                    "re-tagging unprefixed message as screenshot_with_state"
                );
                let mut retagged = fields.clone();
                retagged[0] = "screenshot_with_state";
                Self::parse_screenshot(&retagged)
            }
            _ => Err(PilotError::UnknownMessage(truncate(line, 80))),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Ready => "ready",
            Inbound::ConfigLoaded => "config_loaded",
            Inbound::ConfigError(_) => "config_error",
            Inbound::Screenshot(_) => "screenshot_with_state",
            Inbound::EnhancedScreenshot(_) => "enhanced_screenshot_with_state",
            Inbound::State(_) => "state",
        }
    }

    fn parse_screenshot(fields: &[&str]) -> Result<Self, PilotError> {
        expect_fields("screenshot_with_state", fields, SCREENSHOT_FIELDS)?;
        Ok(Inbound::Screenshot(ScreenshotReport {
            path: PathBuf::from(fields[1].trim()),
            state: RawState::from_fields(&fields[2..6]),
        }))
    }

    fn parse_enhanced(fields: &[&str]) -> Result<Self, PilotError> {
        expect_fields(
            "enhanced_screenshot_with_state",
            fields,
            ENHANCED_SCREENSHOT_FIELDS,
        )?;
        let button_count = fields[7].trim().parse::<u32>().ok();
        if button_count.is_none() {
            warn!(value = fields[7], "non-numeric button count");
        }
        Ok(Inbound::EnhancedScreenshot(EnhancedScreenshotReport {
            path: PathBuf::from(fields[1].trim()),
            previous_path: PathBuf::from(fields[2].trim()),
            state: RawState::from_fields(&fields[3..7]),
            button_count,
        }))
    }
}

fn expect_fields(kind: &'static str, fields: &[&str], expected: usize) -> Result<(), PilotError> {
    if fields.len() < expected {
        return Err(PilotError::MalformedMessage {
            kind,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── Outbound ─────────────────────────────────────────────────────

/// Messages sent to the emulator script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    RequestScreenshot,
    RequestState,
    /// Lua table literal, rendered by [`GameConfigScript`].
    GameConfig(String),
    Buttons(ButtonCommand),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::RequestScreenshot => "request_screenshot",
            Outbound::RequestState => "request_state",
            Outbound::GameConfig(_) => "game_config",
            Outbound::Buttons(_) => "buttons",
        }
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::RequestScreenshot => f.write_str("request_screenshot"),
            Outbound::RequestState => f.write_str("request_state"),
            Outbound::GameConfig(table) => write!(f, "game_config{FIELD_SEPARATOR}{table}"),
            Outbound::Buttons(cmd) => f.write_str(&cmd.encode()),
        }
    }
}

// ── GameConfigScript ─────────────────────────────────────────────

/// Settings pushed to the emulator script after it reports `ready`.
#[derive(Debug, Clone, PartialEq)]
pub struct GameConfigScript {
    /// Where the script should write screenshots.
    pub screenshot_path: String,
    /// Frames between consecutive presses of one command.
    pub separation_frames: u32,
    /// Frames to wait after the last press before capturing.
    pub post_wait_frames: u32,
    /// Whether the service records video between decisions.
    pub continuous_recording: bool,
}

impl GameConfigScript {
    /// Render as a single-line Lua table literal.
    pub fn to_lua(&self) -> String {
        let buttons: Vec<String> = Button::ALL
            .iter()
            .map(|b| format!("{}={}", b.name(), b.code()))
            .collect();
        format!(
            "{{screenshot_path=\"{}\",buttons={{{}}},separation_frames={},post_wait_frames={},continuous_recording={}}}",
            lua_escape(&self.screenshot_path),
            buttons.join(","),
            self.separation_frames,
            self.post_wait_frames,
            self.continuous_recording,
        )
    }

    pub fn into_message(self) -> Outbound {
        Outbound::GameConfig(self.to_lua())
    }
}

fn lua_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_messages() {
        assert_eq!(Inbound::parse("ready").unwrap(), Inbound::Ready);
        assert_eq!(Inbound::parse("config_loaded\r").unwrap(), Inbound::ConfigLoaded);
        assert_eq!(
            Inbound::parse("config_error||bad table").unwrap(),
            Inbound::ConfigError("bad table".into())
        );
    }

    #[test]
    fn parses_screenshot_with_state() {
        let msg = Inbound::parse("screenshot_with_state||/tmp/s.png||2||10||12||3").unwrap();
        let Inbound::Screenshot(report) = msg else {
            panic!("expected screenshot");
        };
        assert_eq!(report.path, PathBuf::from("/tmp/s.png"));
        assert_eq!(report.state.direction, "2");
        assert_eq!(report.state.x, "10");
        assert_eq!(report.state.y, "12");
        assert_eq!(report.state.map_id, "3");
    }

    #[test]
    fn short_screenshot_is_rejected() {
        let err = Inbound::parse("screenshot_with_state||/tmp/s.png||2||10").unwrap_err();
        assert!(matches!(
            err,
            PilotError::MalformedMessage {
                expected: 6,
                actual: 4,
                ..
            }
        ));
    }

    #[test]
    fn parses_enhanced_screenshot() {
        let msg = Inbound::parse(
            "enhanced_screenshot_with_state||/tmp/b.png||/tmp/a.png||UP||1||2||7||3",
        )
        .unwrap();
        let Inbound::EnhancedScreenshot(report) = msg else {
            panic!("expected enhanced screenshot");
        };
        assert_eq!(report.previous_path, PathBuf::from("/tmp/a.png"));
        assert_eq!(report.state.direction, "UP");
        assert_eq!(report.button_count, Some(3));
    }

    #[test]
    fn enhanced_with_bad_count_still_parses() {
        let msg =
            Inbound::parse("enhanced_screenshot_with_state||b||a||1||1||2||7||many").unwrap();
        let Inbound::EnhancedScreenshot(report) = msg else {
            panic!("expected enhanced screenshot");
        };
        assert_eq!(report.button_count, None);
    }

    #[test]
    fn parses_state() {
        let msg = Inbound::parse("state||4||5||6||7").unwrap();
        assert_eq!(
            msg,
            Inbound::State(RawState {
                direction: "4".into(),
                x: "5".into(),
                y: "6".into(),
                map_id: "7".into(),
            })
        );
        assert!(Inbound::parse("state||4||5").is_err());
    }

    #[test]
    fn unprefixed_payload_is_retagged() {
        let msg = Inbound::parse("shot_with_state||/tmp/s.png||1||3||4||9").unwrap();
        assert_eq!(msg.kind(), "screenshot_with_state");
    }

    #[test]
    fn unknown_message_is_an_error() {
        assert!(matches!(
            Inbound::parse("hello"),
            Err(PilotError::UnknownMessage(_))
        ));
        assert!(matches!(
            Inbound::parse("foo||bar"),
            Err(PilotError::UnknownMessage(_))
        ));
    }

    #[test]
    fn outbound_wire_text() {
        assert_eq!(Outbound::RequestScreenshot.to_string(), "request_screenshot");
        assert_eq!(Outbound::RequestState.to_string(), "request_state");
        let cmd = ButtonCommand::from_names(&["UP", "A"], None);
        assert_eq!(Outbound::Buttons(cmd).to_string(), "6,0|2,2");
    }

    #[test]
    fn game_config_is_single_line_lua() {
        let script = GameConfigScript {
            screenshot_path: "C:\\shots\\\"cur\".png".into(),
            separation_frames: 58,
            post_wait_frames: 60,
            continuous_recording: false,
        };
        let text = script.into_message().to_string();
        assert!(text.starts_with("game_config||{"));
        assert!(!text.contains('\n'));
        assert!(text.contains("UP=6"));
        assert!(text.contains("separation_frames=58"));
        assert!(text.contains("C:\\\\shots\\\\\\\"cur\\\".png"));
    }
}
