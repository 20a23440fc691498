//! The poll buffer and the report-line format a polling client reads.
//!
//! | Report | Line |
//! |---|---|
//! | `digital_read` / `analog_read` (any report with `pin` and `value`) | `command/board/pin value` |
//! | `problem` | `problem/board code` |
//! | `i2c_reply`, `i2c_request`, anything else | dropped |

use std::sync::{Arc, Mutex, PoisonError};

use backplane_types::{Command, Fields, Topic};

/// Lines accumulated since the last poll.
///
/// Appending and the swap performed by [`PollBuffer::take`] run under one
/// lock, so a report is either in the returned batch or in the next one.
#[derive(Debug, Clone, Default)]
pub struct PollBuffer {
    inner: Arc<Mutex<String>>,
}

impl PollBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: &str) {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_str(line);
    }

    /// Return everything accumulated and leave the buffer empty.
    pub fn take(&self) -> String {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// `command/board/pin value\n`
pub fn pin_line(command: &str, board: &str, pin: &str, value: &str) -> String {
    format!("{command}/{board}/{pin} {value}\n")
}

/// `problem/board code\n`. The code is sent with a trailing newline on the
/// wire; it is not doubled.
pub fn problem_line(board: &str, problem: &str) -> String {
    format!("problem/{board} {}\n", problem.trim_end())
}

/// Format one decoded report, or `None` for shapes a polling client does
/// not read.
pub fn format_report(topic: &Topic, fields: &Fields) -> Option<String> {
    let board = topic.board_suffix()?;
    let command = fields.command()?;

    if command == Command::I2cReply.as_str() || command == Command::I2cRequest.as_str() {
        return None;
    }

    if command == Command::Problem.as_str() {
        let problem = fields.get("problem")?.render();
        return Some(problem_line(board, &problem));
    }

    let pin = fields.get("pin")?.render();
    let value = fields.get("value")?.render();
    Some(pin_line(command, board, &pin, &value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_swaps_and_clears() {
        let buffer = PollBuffer::new();
        buffer.append("digital_read/1/2 1\n");
        buffer.append("analog_read/1/3 512\n");
        assert_eq!(buffer.take(), "digital_read/1/2 1\nanalog_read/1/3 512\n");
        assert!(buffer.is_empty());
        assert_eq!(buffer.take(), "");
    }

    #[test]
    fn clones_share_one_buffer() {
        let buffer = PollBuffer::new();
        let writer = buffer.clone();
        writer.append("problem/1 3-1\n");
        assert_eq!(buffer.take(), "problem/1 3-1\n");
    }

    #[test]
    fn racing_appends_and_takes_keep_every_line_once() {
        use std::collections::HashSet;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        const WRITERS: usize = 4;
        const LINES: usize = 500;

        let buffer = PollBuffer::new();
        let done = Arc::new(AtomicBool::new(false));

        let poller = {
            let buffer = buffer.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut polled = String::new();
                while !done.load(Ordering::Acquire) {
                    polled.push_str(&buffer.take());
                    thread::yield_now();
                }
                polled
            })
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..LINES {
                        buffer.append(&pin_line("digital_read", &w.to_string(), &i.to_string(), "1"));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);

        let mut polled = poller.join().unwrap();
        polled.push_str(&buffer.take());

        let lines: Vec<&str> = polled.lines().collect();
        assert_eq!(lines.len(), WRITERS * LINES);
        let unique: HashSet<&str> = lines.iter().copied().collect();
        assert_eq!(unique.len(), WRITERS * LINES);
        for w in 0..WRITERS {
            for i in 0..LINES {
                assert!(unique.contains(format!("digital_read/{w}/{i} 1").as_str()));
            }
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn digital_report_line() {
        let fields = Fields::new(Command::DigitalRead)
            .with("pin", 2i64)
            .with("value", 1i64);
        assert_eq!(
            format_report(&Topic::report(1), &fields).as_deref(),
            Some("digital_read/1/2 1\n")
        );
    }

    #[test]
    fn two_digit_board_is_kept_whole() {
        let fields = Fields::new(Command::AnalogRead)
            .with("pin", "P9_39")
            .with("value", "42.5");
        assert_eq!(
            format_report(&Topic::report(10), &fields).as_deref(),
            Some("analog_read/10/P9_39 42.5\n")
        );
    }

    #[test]
    fn problem_report_line() {
        let fields = Fields::new(Command::Problem)
            .with("board", 3i64)
            .with("problem", "7-5\n");
        assert_eq!(
            format_report(&Topic::report(3), &fields).as_deref(),
            Some("problem/3 7-5\n")
        );
    }

    #[test]
    fn i2c_and_incomplete_reports_are_dropped() {
        let reply = Fields::new(Command::I2cReply)
            .with("board", 1i64)
            .with("data", vec![1u8, 2]);
        assert_eq!(format_report(&Topic::report(1), &reply), None);

        let no_value = Fields::new(Command::DigitalRead).with("pin", 2i64);
        assert_eq!(format_report(&Topic::report(1), &no_value), None);

        let no_problem = Fields::new(Command::Problem).with("board", 1i64);
        assert_eq!(format_report(&Topic::report(1), &no_problem), None);
    }
}
