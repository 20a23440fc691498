//! Per-platform rules that differ between otherwise identical bridges.
//!
//! | | Arduino | BeagleBone | Raspberry Pi |
//! |---|---|---|---|
//! | pin ids | integer index | header name, upper-cased | BCM integer |
//! | `analog_write` range | 0–255 (integer) | 0–100 duty % | 0–255 (integer) |
//! | servo output | degrees | duty %, optionally inverted | pulse width µs |
//! | sonar pins | digital inputs | analog inputs | none |

use std::fmt;
use std::str::FromStr;

use backplane_types::{BackplaneError, FieldValue};

use crate::pin::{Bank, PinId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServoPolarity {
    Normal,
    #[default]
    Inverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Arduino,
    BeagleBone { polarity: ServoPolarity },
    RaspberryPi,
}

/// Value a servo write is translated into for the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoOutput {
    Degrees(u8),
    DutyCycle(f64),
    PulseWidthUs(u32),
}

const BEAGLEBONE_DUTY_MIN: f64 = 3.0;
const BEAGLEBONE_DUTY_MAX: f64 = 14.5;
const PI_PULSE_MIN_US: u32 = 500;
const PI_PULSE_SPAN_US: u32 = 2000;

pub const SERVO_MAX_DEGREES: i64 = 180;

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::Arduino => "arduino",
            Platform::BeagleBone { .. } => "beaglebone",
            Platform::RaspberryPi => "raspberrypi",
        }
    }

    /// Interpret a payload `pin` field. `None` means the value can never
    /// name a pin on this platform.
    pub fn parse_pin(self, raw: &FieldValue) -> Option<PinId> {
        match self {
            Platform::Arduino | Platform::RaspberryPi => raw
                .parse_int()
                .and_then(|n| u16::try_from(n).ok())
                .map(PinId::Index),
            Platform::BeagleBone { .. } => raw
                .as_str()
                .map(|s| PinId::Named(s.trim().to_ascii_uppercase())),
        }
    }

    /// Inclusive upper bound of `analog_write` values.
    pub fn pwm_max(self) -> f64 {
        match self {
            Platform::BeagleBone { .. } => 100.0,
            Platform::Arduino | Platform::RaspberryPi => 255.0,
        }
    }

    /// Parse an `analog_write` value. Integer platforms reject fractions.
    pub fn parse_pwm(self, raw: &FieldValue) -> Option<f64> {
        match self {
            Platform::BeagleBone { .. } => raw.parse_float().filter(|v| v.is_finite()),
            Platform::Arduino | Platform::RaspberryPi => raw.parse_int().map(|n| n as f64),
        }
    }

    /// Linear map from 0–180° to the platform's servo signal. `degrees` must
    /// already be validated.
    pub fn servo_output(self, degrees: u8) -> ServoOutput {
        let fraction = f64::from(degrees) / SERVO_MAX_DEGREES as f64;
        match self {
            Platform::Arduino => ServoOutput::Degrees(degrees),
            Platform::BeagleBone { polarity } => {
                let duty = fraction * (BEAGLEBONE_DUTY_MAX - BEAGLEBONE_DUTY_MIN) + BEAGLEBONE_DUTY_MIN;
                ServoOutput::DutyCycle(match polarity {
                    ServoPolarity::Inverted => 100.0 - duty,
                    ServoPolarity::Normal => duty,
                })
            }
            Platform::RaspberryPi => {
                ServoOutput::PulseWidthUs(PI_PULSE_MIN_US + u32::from(degrees) * PI_PULSE_SPAN_US / 180)
            }
        }
    }

    /// Bank holding pins that can be configured for sonar.
    pub fn sonar_bank(self) -> Bank {
        match self {
            Platform::BeagleBone { .. } => Bank::Analog,
            Platform::Arduino | Platform::RaspberryPi => Bank::Digital,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = BackplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arduino" => Ok(Platform::Arduino),
            "beaglebone" | "bbb" => Ok(Platform::BeagleBone {
                polarity: ServoPolarity::default(),
            }),
            "raspberrypi" | "rpi" => Ok(Platform::RaspberryPi),
            other => Err(BackplaneError::Config(format!("unknown platform '{other}'"))),
        }
    }
}
