//! Path-style GET endpoints.
//!
//! | Path | Effect |
//! |---|---|
//! | `/digital_pin_mode/{board}/{enable}/{pin}/{mode}` | command to `A{board}` |
//! | `/analog_pin_mode/{board}/{enable}/{pin}` | command to `A{board}` |
//! | `/digital_write/{board}/{pin}/{value}` | command to `A{board}` |
//! | `/analog_write/{board}/{pin}/{value}` | command to `A{board}` |
//! | `/play_tone/{board}/{pin}/{frequency}/{duration}` | command to `A{board}` |
//! | `/tone_off/{board}/{pin}` | command to `A{board}` |
//! | `/set_servo_position/{board}/{pin}/{position}` | command to `A{board}` |
//! | `/tweet/{message}` | command to `A100` |
//! | `/digital_read/{board}/{pin}/{value}` | line appended to the poll buffer |
//! | `/analog_read/{board}/{pin}/{value}` | line appended to the poll buffer |
//! | `/problem/{board}/{problem}` | line appended to the poll buffer |
//! | `/poll` | drain the poll buffer |
//!
//! Segments are percent-decoded. Command endpoints answer `ok` as soon as the
//! message is handed to the link; they never wait for the bridge.

use backplane_middleware::{PairSender, Publisher, codec};
use backplane_types::{
    BackplaneError, Command, Enable, Fields, Message, PASS_THROUGH_BOARD, PinMode, Topic,
};
use tracing::{debug, warn};

use crate::poll::{self, PollBuffer};

/// A parsed request path.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Publish `fields` on `topic`.
    Command { topic: Topic, fields: Fields },
    /// Append a ready-made line to the poll buffer.
    Inject(String),
    Poll,
}

/// Where command messages go: a router publish port, or the direct pair.
#[derive(Debug, Clone)]
pub enum CommandLink {
    PubSub(Publisher),
    Pair(PairSender),
}

impl CommandLink {
    pub fn send(&self, message: Message) -> Result<(), BackplaneError> {
        match self {
            CommandLink::PubSub(publisher) => {
                publisher.send(message);
                Ok(())
            }
            CommandLink::Pair(sender) => sender.send(message),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Responses
// ────────────────────────────────────────────────────────────────────────────

pub const POLL_CONTENT_TYPE: &str = "text/html; charset=ISO-8859-1";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: &'static str,
    /// Adds `Access-Control-Allow-Origin: *`.
    pub allow_any_origin: bool,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self::text(200, "OK", "ok")
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found", "not found")
    }

    pub fn text(status: u16, reason: &'static str, body: &str) -> Self {
        Self {
            status,
            reason,
            content_type: TEXT_CONTENT_TYPE,
            allow_any_origin: false,
            body: body.as_bytes().to_vec(),
        }
    }

    fn poll(body: &str) -> Self {
        Self {
            status: 200,
            reason: "OK",
            content_type: POLL_CONTENT_TYPE,
            allow_any_origin: true,
            body: latin1(body),
        }
    }

    /// Status line, headers and body as sent on the socket.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n",
            self.status,
            self.reason,
            self.content_type,
            self.body.len()
        );
        if self.allow_any_origin {
            head.push_str("Access-Control-Allow-Origin: *\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// ISO-8859-1 bytes for `text`; characters outside it become `?`.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Parsing
// ────────────────────────────────────────────────────────────────────────────

/// `Enable` / `Disable` in canonical case; anything else is passed through
/// for the bridge to reject.
fn enable_word(word: &str) -> String {
    Enable::from_wire(word).map_or_else(|| word.to_string(), |e| e.as_str().to_string())
}

fn mode_word(word: &str) -> String {
    PinMode::from_wire(word).map_or_else(|| word.to_string(), |m| m.wire_name().to_string())
}

fn board_topic(board: &str) -> Topic {
    let mut bytes = vec![Topic::COMMAND_PREFIX];
    bytes.extend_from_slice(board.as_bytes());
    Topic::new(bytes)
}

fn command(board: &str, fields: Fields) -> Route {
    Route::Command {
        topic: board_topic(board),
        fields,
    }
}

/// Parse a request path (query string ignored). `None` for unknown paths,
/// wrong segment counts and segments that do not decode to UTF-8.
pub fn parse(path: &str) -> Option<Route> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments = path
        .trim_start_matches('/')
        .split('/')
        .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
        .collect::<Option<Vec<_>>>()?;
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let route = match segments.as_slice() {
        ["digital_pin_mode", board, enable, pin, mode] => command(
            board,
            Fields::new(Command::DigitalPinMode)
                .with("enable", enable_word(enable))
                .with("pin", *pin)
                .with("mode", mode_word(mode)),
        ),
        ["analog_pin_mode", board, enable, pin] => command(
            board,
            Fields::new(Command::AnalogPinMode)
                .with("enable", enable_word(enable))
                .with("pin", *pin),
        ),
        ["digital_write", board, pin, value] => command(
            board,
            Fields::new(Command::DigitalWrite)
                .with("pin", *pin)
                .with("value", *value),
        ),
        ["analog_write", board, pin, value] => command(
            board,
            Fields::new(Command::AnalogWrite)
                .with("pin", *pin)
                .with("value", *value),
        ),
        ["play_tone", board, pin, frequency, duration] => command(
            board,
            Fields::new(Command::PlayTone)
                .with("pin", *pin)
                .with("frequency", *frequency)
                .with("duration", *duration),
        ),
        ["tone_off", board, pin] => {
            command(board, Fields::new(Command::ToneOff).with("pin", *pin))
        }
        ["set_servo_position", board, pin, position] => command(
            board,
            Fields::new(Command::SetServoPosition)
                .with("pin", *pin)
                .with("position", *position),
        ),
        ["tweet", message] => Route::Command {
            topic: Topic::command(PASS_THROUGH_BOARD),
            fields: Fields::new(Command::Tweet).with("message", *message),
        },
        [report @ ("digital_read" | "analog_read"), board, pin, value] => {
            Route::Inject(poll::pin_line(report, board, pin, value))
        }
        ["problem", board, problem] => Route::Inject(poll::problem_line(board, problem)),
        ["poll"] => Route::Poll,
        _ => return None,
    };
    Some(route)
}

/// Serve one request path.
pub fn handle(path: &str, link: &CommandLink, buffer: &PollBuffer) -> Response {
    match parse(path) {
        Some(Route::Poll) => Response::poll(&buffer.take()),
        Some(Route::Inject(line)) => {
            buffer.append(&line);
            Response::ok()
        }
        Some(Route::Command { topic, fields }) => {
            let sent = codec::encode(topic.clone(), &fields).and_then(|m| link.send(m));
            match sent {
                Ok(()) => {
                    debug!(%topic, command = fields.command().unwrap_or_default(), "command published");
                    Response::ok()
                }
                Err(e) => {
                    warn!(%topic, error = %e, "command not delivered");
                    Response::text(503, "Service Unavailable", &e.to_string())
                }
            }
        }
        None => {
            debug!(path, "unknown path");
            Response::not_found()
        }
    }
}
