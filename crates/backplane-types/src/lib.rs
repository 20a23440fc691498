//! Shared vocabulary for every process on the backplane.
//!
//! Routers, bridges and front-ends all speak in terms of the types defined
//! here: a [`Topic`]-addressed [`Message`] whose payload decodes into a
//! [`Fields`] map, the closed [`Command`] vocabulary, the per-pin
//! [`PinMode`], and the [`ProblemReport`] a bridge publishes when it rejects
//! a command.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

mod fields;
mod problem;

pub use fields::{FieldValue, Fields};
pub use problem::{ProblemCode, ProblemReport};

/// Highest board number addressable under the `A`/`B` envelope convention.
pub const MAX_BOARD: u16 = 10;

/// Pseudo board number used for pass-through (tweet) commands.
pub const PASS_THROUGH_BOARD: u16 = 100;

// ────────────────────────────────────────────────────────────────────────────
// Topic
// ────────────────────────────────────────────────────────────────────────────

/// Envelope address used as a pub/sub filter.
///
/// Subscribers register a prefix and receive every message whose topic
/// *starts with* that prefix. By convention `A<n>` addresses commands to
/// board `n`, `B<n>` carries reports from board `n`, and `Q` is the
/// broadcast address for a shared i2c bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Topic(Vec<u8>);

impl Topic {
    pub const COMMAND_PREFIX: u8 = b'A';
    pub const REPORT_PREFIX: u8 = b'B';
    pub const BROADCAST: u8 = b'Q';

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// `A<board>`: commands addressed to one board.
    pub fn command(board: u16) -> Self {
        Self(format!("A{board}").into_bytes())
    }

    /// `B<board>`: reports published by one board.
    pub fn report(board: u16) -> Self {
        Self(format!("B{board}").into_bytes())
    }

    /// `Q`: broadcast-to-all on a shared bus.
    pub fn broadcast() -> Self {
        Self(vec![Self::BROADCAST])
    }

    /// The empty prefix, which matches every topic.
    pub fn everything() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix match, the delivery rule for subscriptions.
    pub fn starts_with(&self, prefix: &Topic) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Everything after the leading envelope letter, e.g. `"10"` for `B10`.
    pub fn board_suffix(&self) -> Option<&str> {
        let rest = self.0.get(1..)?;
        std::str::from_utf8(rest).ok().filter(|s| !s.is_empty())
    }

    /// Board number encoded in an `A<n>` or `B<n>` topic.
    pub fn board(&self) -> Option<u16> {
        match self.0.first()? {
            &Self::COMMAND_PREFIX | &Self::REPORT_PREFIX => self.board_suffix()?.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&[u8]> for Topic {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Message
// ────────────────────────────────────────────────────────────────────────────

/// One envelope on the wire: a topic and an opaque payload.
///
/// Routers never look inside `payload`; bridges and front-ends decode it
/// with the envelope codec in `backplane-middleware`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<Topic>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Command vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// The closed set of command names carried in a payload's `command` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    DigitalPinMode,
    AnalogPinMode,
    DigitalWrite,
    AnalogWrite,
    PlayTone,
    ToneOff,
    SetServoPosition,
    I2cRequest,
    /// Report: a digital input changed.
    DigitalRead,
    /// Report: an analog input was sampled.
    AnalogRead,
    /// Report: the bridge rejected a command.
    Problem,
    /// Report: bytes read back from an i2c device.
    I2cReply,
    /// Pass-through text for the pseudo board.
    Tweet,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::DigitalPinMode,
        Command::AnalogPinMode,
        Command::DigitalWrite,
        Command::AnalogWrite,
        Command::PlayTone,
        Command::ToneOff,
        Command::SetServoPosition,
        Command::I2cRequest,
        Command::DigitalRead,
        Command::AnalogRead,
        Command::Problem,
        Command::I2cReply,
        Command::Tweet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::DigitalPinMode => "digital_pin_mode",
            Command::AnalogPinMode => "analog_pin_mode",
            Command::DigitalWrite => "digital_write",
            Command::AnalogWrite => "analog_write",
            Command::PlayTone => "play_tone",
            Command::ToneOff => "tone_off",
            Command::SetServoPosition => "set_servo_position",
            Command::I2cRequest => "i2c_request",
            Command::DigitalRead => "digital_read",
            Command::AnalogRead => "analog_read",
            Command::Problem => "problem",
            Command::I2cReply => "i2c_reply",
            Command::Tweet => "tweet",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = BackplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BackplaneError::MalformedPayload(format!("unknown command '{s}'")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pin modes
// ────────────────────────────────────────────────────────────────────────────

/// Configured mode of a single pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PinMode {
    #[default]
    Unset,
    Input,
    Output,
    Pwm,
    Servo,
    Tone,
    Analog,
    Sonar,
}

impl PinMode {
    /// Name used in `digital_pin_mode` payloads.
    pub fn wire_name(self) -> &'static str {
        match self {
            PinMode::Unset => "Unset",
            PinMode::Input => "Input",
            PinMode::Output => "Output",
            PinMode::Pwm => "PWM",
            PinMode::Servo => "Servo",
            PinMode::Tone => "Tone",
            PinMode::Analog => "Analog",
            PinMode::Sonar => "SONAR",
        }
    }

    /// Case-insensitive parse of a wire mode name. `Unset` is never parsed.
    pub fn from_wire(s: &str) -> Option<Self> {
        [
            PinMode::Input,
            PinMode::Output,
            PinMode::Pwm,
            PinMode::Servo,
            PinMode::Tone,
            PinMode::Analog,
            PinMode::Sonar,
        ]
        .into_iter()
        .find(|m| m.wire_name().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The `enable` field of pin-mode commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enable {
    Enable,
    Disable,
}

impl Enable {
    pub fn as_str(self) -> &'static str {
        match self {
            Enable::Enable => "Enable",
            Enable::Disable => "Disable",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("enable") {
            Some(Enable::Enable)
        } else if s.eq_ignore_ascii_case("disable") {
            Some(Enable::Disable)
        } else {
            None
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every backplane crate.
///
/// Validation failures inside a bridge are *not* errors; they become
/// [`ProblemReport`]s published to the remote caller.
#[derive(Error, Debug)]
pub enum BackplaneError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Payload has no `command` field")]
    MissingCommand,

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Bind failed on {addr}: {details}")]
    Bind { addr: String, details: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Hardware fault on {component}: {details}")]
    Hardware { component: String, details: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
