//! The boundary between a bridge and its physical device.
//!
//! A bridge owns exactly one [`PinDriver`]. The bridge validates every
//! command against its pin table before calling the driver, so drivers may
//! assume pins exist and modes match. Drivers push asynchronous input
//! changes through the [`ReportSink`] handed to them when an input is
//! enabled.

use std::sync::Arc;

use backplane_types::{BackplaneError, FieldValue, Fields, PinMode};

use crate::capability::Capabilities;
use crate::pin::{Bank, PinId};
use crate::platform::{Platform, ServoOutput};

/// Outbound path for driver-initiated reports (`digital_read`,
/// `analog_read`). Implementations publish under the bridge's report topic.
pub trait ReportSink: Send + Sync {
    fn report(&self, fields: Fields);
}

/// A value to drive onto an output pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinOutput {
    Digital(bool),
    Pwm(f64),
    Servo(ServoOutput),
    Tone { frequency: u32, duration_ms: u32 },
    ToneOff,
}

/// A validated `i2c_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cRequest {
    Init { address: u8 },
    WriteByte { address: u8, register: u8, value: u8 },
    ReadBlock { address: u8, register: u8, num_bytes: u8 },
}

impl I2cRequest {
    pub fn address(self) -> u8 {
        match self {
            I2cRequest::Init { address }
            | I2cRequest::WriteByte { address, .. }
            | I2cRequest::ReadBlock { address, .. } => address,
        }
    }
}

/// What the driver did with an i2c request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cOutcome {
    Done,
    /// The reply will be available from [`PinDriver::poll_i2c_reply`].
    Pending,
}

pub trait PinDriver: Send {
    fn platform(&self) -> Platform;

    /// One-time probe run while the bridge is discovering.
    fn discover(&mut self) -> Result<Capabilities, BackplaneError>;

    /// Put `pin` into `mode`. Input-type modes (`Input`, `Analog`, `Sonar`)
    /// report changes through `sink` until disabled.
    fn enable(
        &mut self,
        bank: Bank,
        pin: &PinId,
        mode: PinMode,
        sink: Arc<dyn ReportSink>,
    ) -> Result<(), BackplaneError>;

    /// Stop driving or reporting `pin`.
    fn disable(&mut self, bank: Bank, pin: &PinId, mode: PinMode) -> Result<(), BackplaneError>;

    fn write(&mut self, pin: &PinId, output: PinOutput) -> Result<(), BackplaneError>;

    /// Current value of an input pin.
    fn read(&mut self, bank: Bank, pin: &PinId) -> Result<FieldValue, BackplaneError>;

    fn i2c_request(&mut self, request: I2cRequest) -> Result<I2cOutcome, BackplaneError> {
        Err(BackplaneError::Hardware {
            component: format!("i2c@{}", request.address()),
            details: format!("{} has no i2c bus", self.platform()),
        })
    }

    /// Reply bytes for the last [`I2cOutcome::Pending`] read, once available.
    fn poll_i2c_reply(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Release the device. Called exactly once, at bridge shutdown.
    fn cleanup(&mut self);
}
