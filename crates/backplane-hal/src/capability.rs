//! Capability discovery: which pins support which modes.
//!
//! Arduino boards describe themselves with a Firmata capability report and
//! analog map; the other platforms have fixed header layouts.

use backplane_types::PinMode;
use tracing::debug;

use crate::pin::{ModeSet, PinId};

/// Delimiter between pins in a capability report, and "no channel" in an
/// analog map.
pub const FIRMATA_DELIMITER: u8 = 127;

const FIRMATA_INPUT: u8 = 0;
const FIRMATA_OUTPUT: u8 = 1;
const FIRMATA_ANALOG: u8 = 2;
const FIRMATA_PWM: u8 = 3;
const FIRMATA_SERVO: u8 = 4;
const FIRMATA_I2C: u8 = 6;

/// BeagleBone Black header pins usable as GPIO.
pub const BEAGLEBONE_GPIO_PINS: &[&str] = &[
    "P9_11", "P9_12", "P9_13", "P9_14", "P9_15", "P9_16", "P9_17", "P9_18", "P9_21", "P9_22",
    "P9_23", "P9_24", "P9_25", "P9_26", "P9_27", "P9_29", "P9_30", "P9_31", "P9_41", "P9_42",
    "P8_7", "P8_8", "P8_9", "P8_10", "P8_11", "P8_12", "P8_13", "P8_14", "P8_15", "P8_16",
    "P8_17", "P8_18", "P8_19", "P8_26",
];

/// BeagleBone Black header pins with a PWM channel.
pub const BEAGLEBONE_PWM_PINS: &[&str] = &["P9_14", "P9_16", "P9_21", "P9_22", "P9_42", "P8_13", "P8_19"];

/// BeagleBone Black ADC inputs.
pub const BEAGLEBONE_ANALOG_PINS: &[&str] = &["P9_33", "P9_35", "P9_36", "P9_37", "P9_38", "P9_39", "P9_40"];

/// Raspberry Pi BCM GPIO numbers exposed on the 40-pin header.
pub const RASPBERRY_PI_GPIO: std::ops::RangeInclusive<u16> = 2..=27;

/// Result of the one-time capability probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub digital: Vec<(PinId, ModeSet)>,
    pub analog: Vec<(PinId, ModeSet)>,
    /// Whether the board has an i2c bus the bridge can drive.
    pub i2c: bool,
}

impl Capabilities {
    /// Parse a Firmata capability report and analog map.
    ///
    /// The report is a sequence of `(mode, resolution)` byte pairs per pin,
    /// each pin terminated by [`FIRMATA_DELIMITER`]. A pin's digital index
    /// is its position in the report. Analog channels are the non-delimiter
    /// entries of the analog map.
    pub fn from_firmata(report: &[u8], analog_map: &[u8]) -> Self {
        let mut caps = Capabilities::default();

        for (index, pin_bytes) in report
            .split(|&b| b == FIRMATA_DELIMITER)
            .take(report.iter().filter(|&&b| b == FIRMATA_DELIMITER).count())
            .enumerate()
        {
            let mut modes = ModeSet::EMPTY;
            for &code in pin_bytes.iter().step_by(2) {
                match code {
                    FIRMATA_INPUT => {
                        modes.insert(PinMode::Input);
                        modes.insert(PinMode::Sonar);
                    }
                    FIRMATA_OUTPUT => modes.insert(PinMode::Output),
                    FIRMATA_ANALOG => {}
                    FIRMATA_PWM => modes.insert(PinMode::Pwm),
                    FIRMATA_SERVO => {
                        modes.insert(PinMode::Servo);
                        modes.insert(PinMode::Tone);
                    }
                    FIRMATA_I2C => caps.i2c = true,
                    other => debug!(pin = index, mode = other, "ignoring firmata pin mode"),
                }
            }
            let Ok(index) = u16::try_from(index) else {
                break;
            };
            caps.digital.push((PinId::Index(index), modes));
        }

        caps.analog = analog_map
            .iter()
            .filter(|&&ch| ch != FIRMATA_DELIMITER)
            .map(|&ch| (PinId::Index(u16::from(ch)), ModeSet::of(&[PinMode::Analog])))
            .collect();
        caps.analog.sort_by(|a, b| a.0.cmp(&b.0));
        caps.analog.dedup_by(|a, b| a.0 == b.0);

        caps
    }

    /// Fixed BeagleBone Black layout.
    pub fn beaglebone_black() -> Self {
        let mut digital: Vec<(PinId, ModeSet)> = BEAGLEBONE_GPIO_PINS
            .iter()
            .map(|&name| (PinId::from(name), ModeSet::of(&[PinMode::Input, PinMode::Output])))
            .collect();
        for &name in BEAGLEBONE_PWM_PINS {
            let pwm = [PinMode::Pwm, PinMode::Servo, PinMode::Tone];
            match digital.iter_mut().find(|(id, _)| *id == PinId::from(name)) {
                Some((_, modes)) => pwm.into_iter().for_each(|m| modes.insert(m)),
                None => digital.push((PinId::from(name), ModeSet::of(&pwm))),
            }
        }
        let analog = BEAGLEBONE_ANALOG_PINS
            .iter()
            .map(|&name| (PinId::from(name), ModeSet::of(&[PinMode::Analog, PinMode::Sonar])))
            .collect();
        Self {
            digital,
            analog,
            i2c: false,
        }
    }

    /// BCM GPIO 2–27, all PWM / servo capable, no ADC.
    pub fn raspberry_pi() -> Self {
        let digital = RASPBERRY_PI_GPIO
            .map(|n| {
                (
                    PinId::Index(n),
                    ModeSet::of(&[
                        PinMode::Input,
                        PinMode::Output,
                        PinMode::Pwm,
                        PinMode::Servo,
                        PinMode::Tone,
                    ]),
                )
            })
            .collect();
        Self {
            digital,
            analog: Vec::new(),
            i2c: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_firmata_report() {
        // pin 0: input+output; pin 1: output+pwm+servo; pin 2: analog+i2c
        let report = [
            0, 1, 1, 1, 127, //
            1, 1, 3, 8, 4, 14, 127, //
            2, 10, 6, 1, 127,
        ];
        let analog_map = [127, 127, 0];
        let caps = Capabilities::from_firmata(&report, &analog_map);

        assert_eq!(caps.digital.len(), 3);
        let (id0, m0) = &caps.digital[0];
        assert_eq!(*id0, PinId::Index(0));
        assert!(m0.contains(PinMode::Input) && m0.contains(PinMode::Output));
        assert!(m0.contains(PinMode::Sonar));
        assert!(!m0.contains(PinMode::Pwm));

        let (_, m1) = &caps.digital[1];
        assert!(m1.contains(PinMode::Pwm) && m1.contains(PinMode::Servo));
        assert!(!m1.contains(PinMode::Input));

        assert!(caps.digital[2].1.is_empty());
        assert!(caps.i2c);
        assert_eq!(caps.analog, vec![(PinId::Index(0), ModeSet::of(&[PinMode::Analog]))]);
    }

    #[test]
    fn trailing_bytes_without_delimiter_are_not_a_pin() {
        let caps = Capabilities::from_firmata(&[0, 1, 127, 1, 1], &[]);
        assert_eq!(caps.digital.len(), 1);
        assert!(!caps.i2c);
    }

    #[test]
    fn beaglebone_pwm_pins_are_gpio_too() {
        let caps = Capabilities::beaglebone_black();
        let p9_14 = caps
            .digital
            .iter()
            .find(|(id, _)| *id == PinId::from("P9_14"))
            .map(|(_, m)| *m)
            .unwrap();
        assert!(p9_14.contains(PinMode::Output));
        assert!(p9_14.contains(PinMode::Servo));
        assert_eq!(caps.analog.len(), 7);
        assert!(caps.analog.iter().all(|(_, m)| m.contains(PinMode::Sonar)));
    }

    #[test]
    fn raspberry_pi_has_no_analog() {
        let caps = Capabilities::raspberry_pi();
        assert_eq!(caps.digital.len(), 26);
        assert!(caps.analog.is_empty());
    }
}
