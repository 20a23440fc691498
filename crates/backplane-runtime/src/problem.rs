//! Problem codes and the single-slot pending problem.
//!
//! | Group | Command |
//! |---|---|
//! | 1 | `digital_pin_mode` |
//! | 2 | `analog_pin_mode` |
//! | 3 | `digital_write` |
//! | 4 | `analog_write` |
//! | 5 | `play_tone` |
//! | 6 | `tone_off` |
//! | 7 | `set_servo_position` |
//! | 8 | `i2c_request` |

use backplane_types::{ProblemCode, ProblemReport};
use tracing::debug;

macro_rules! problems {
    ($($name:ident = ($group:literal, $detail:literal, $reason:literal);)*) => {
        $(pub const $name: ProblemReport = ProblemReport::new(ProblemCode::new($group, $detail), $reason);)*
    };
}

pub mod codes {
    use super::*;

    problems! {
        PIN_MODE_INVALID_PIN = (1, 1, "invalid pin");
        PIN_MODE_INVALID_ENABLE = (1, 2, "invalid enable word");
        PIN_MODE_INPUT_UNSUPPORTED = (1, 3, "pin does not support input");
        PIN_MODE_OUTPUT_UNSUPPORTED = (1, 4, "pin does not support output");
        PIN_MODE_PWM_UNSUPPORTED = (1, 5, "pin does not support PWM");
        PIN_MODE_SERVO_UNSUPPORTED = (1, 6, "pin does not support servo");
        PIN_MODE_TONE_UNSUPPORTED = (1, 7, "pin does not support tone");
        PIN_MODE_SONAR_UNSUPPORTED = (1, 8, "pin does not support sonar");
        PIN_MODE_UNKNOWN_MODE = (1, 9, "unknown mode");
        PIN_MODE_NOT_CONFIGURED = (1, 10, "disable on an unconfigured pin");

        ANALOG_MODE_INVALID_PIN = (2, 1, "invalid analog pin");
        ANALOG_MODE_INVALID_ENABLE = (2, 2, "invalid enable word");

        DIGITAL_WRITE_INVALID_PIN = (3, 1, "invalid pin");
        DIGITAL_WRITE_WRONG_MODE = (3, 2, "pin not in Output mode");
        DIGITAL_WRITE_DISABLED = (3, 3, "pin disabled");
        DIGITAL_WRITE_INVALID_VALUE = (3, 4, "invalid value");

        ANALOG_WRITE_INVALID_PIN = (4, 1, "invalid pin");
        ANALOG_WRITE_WRONG_MODE = (4, 2, "pin not in PWM mode");
        ANALOG_WRITE_DISABLED = (4, 3, "pin disabled");
        ANALOG_WRITE_INVALID_VALUE = (4, 4, "invalid value");
        ANALOG_WRITE_OUT_OF_RANGE = (4, 5, "value out of range");

        TONE_INVALID_PIN = (5, 1, "invalid pin");
        TONE_WRONG_MODE = (5, 2, "pin not in Tone mode");
        TONE_DISABLED = (5, 3, "pin disabled");
        TONE_INVALID_FREQUENCY = (5, 4, "invalid frequency");
        TONE_INVALID_DURATION = (5, 5, "invalid duration");

        TONE_OFF_INVALID_PIN = (6, 1, "invalid pin");
        TONE_OFF_WRONG_MODE = (6, 2, "pin not in Tone mode");
        TONE_OFF_DISABLED = (6, 3, "pin disabled");

        SERVO_INVALID_PIN = (7, 1, "invalid pin");
        SERVO_WRONG_MODE = (7, 2, "pin not in Servo mode");
        SERVO_DISABLED = (7, 3, "pin disabled");
        SERVO_INVALID_POSITION = (7, 4, "invalid position");
        SERVO_OUT_OF_RANGE = (7, 5, "position out of range");

        I2C_INVALID_ADDRESS = (8, 1, "invalid device address");
        I2C_UNKNOWN_CMD = (8, 2, "unknown i2c cmd");
        I2C_INVALID_ARGUMENT = (8, 3, "invalid register, value or num_bytes");
        I2C_NOT_INITIALIZED = (8, 4, "device not initialized");
        I2C_TIMEOUT = (8, 5, "reply timeout");
        I2C_UNSUPPORTED = (8, 6, "i2c unsupported on this platform");
    }
}

/// At most one problem waits to be published. A problem raised before the
/// previous one was flushed replaces it.
#[derive(Debug, Default)]
pub struct ProblemSlot(Option<ProblemReport>);

impl ProblemSlot {
    pub fn set(&mut self, report: ProblemReport) {
        if let Some(previous) = self.0.replace(report) {
            debug!(code = %previous.code, "unflushed problem replaced");
        }
    }

    pub fn take(&mut self) -> Option<ProblemReport> {
        self.0.take()
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }
}
