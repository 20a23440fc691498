//! In-process simulated boards for headless runs and tests.
//!
//! [`SimBoard`] implements [`PinDriver`] for each supported [`Platform`],
//! discovering the same capability layout the real board reports. Every
//! driver call is recorded; a cloneable [`SimHandle`] lets tests inspect the
//! record, inject input changes, set analog levels and attach i2c devices.
//!
//! # Example
//!
//! ```rust
//! use backplane_hal::PinDriver;
//! use backplane_hal::sim::SimBoard;
//!
//! let mut board = SimBoard::arduino_uno();
//! let caps = board.discover().expect("sim discovery must succeed");
//! assert_eq!(caps.digital.len(), 20);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backplane_types::{BackplaneError, Command, FieldValue, Fields, PinMode};
use tracing::debug;

use crate::analog_reader::{AnalogReader, AnalogSource, DEFAULT_INTERVAL};
use crate::capability::{Capabilities, FIRMATA_DELIMITER};
use crate::driver::{I2cOutcome, I2cRequest, PinDriver, PinOutput, ReportSink};
use crate::pin::{Bank, PinId};
use crate::platform::{Platform, ServoPolarity};

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    Enable { bank: Bank, pin: PinId, mode: PinMode },
    Disable { bank: Bank, pin: PinId, mode: PinMode },
    Write { pin: PinId, output: PinOutput },
    I2c(I2cRequest),
    Cleanup,
}

/// Number of reply polls before a pending read completes.
pub const DEFAULT_I2C_LATENCY: u32 = 2;

#[derive(Default)]
struct SimState {
    ops: Vec<SimOp>,
    digital_values: HashMap<PinId, i64>,
    analog_levels: HashMap<PinId, f64>,
    analog_raw: HashMap<PinId, u16>,
    inputs: HashMap<PinId, Arc<dyn ReportSink>>,
    i2c_devices: HashMap<u8, Vec<u8>>,
    i2c_latency: u32,
    pending_reply: Option<(u32, Vec<u8>)>,
    fail_writes: bool,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Test-side view of a [`SimBoard`]. Clones share the same board.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn ops(&self) -> Vec<SimOp> {
        lock(&self.state).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.state).ops.clear();
    }

    /// Only the recorded writes, in order.
    pub fn writes(&self) -> Vec<(PinId, PinOutput)> {
        lock(&self.state)
            .ops
            .iter()
            .filter_map(|op| match op {
                SimOp::Write { pin, output } => Some((pin.clone(), *output)),
                _ => None,
            })
            .collect()
    }

    /// Change a digital input. If the pin is enabled for input, a
    /// `digital_read` report is pushed immediately.
    pub fn inject_input(&self, pin: impl Into<PinId>, value: i64) {
        let pin = pin.into();
        let sink = {
            let mut state = lock(&self.state);
            state.digital_values.insert(pin.clone(), value);
            state.inputs.get(&pin).cloned()
        };
        if let Some(sink) = sink {
            sink.report(
                Fields::new(Command::DigitalRead)
                    .with("pin", pin.to_string())
                    .with("value", value),
            );
        }
    }

    /// Normalised level (0.0–1.0) returned for an analog channel.
    pub fn set_analog(&self, channel: impl Into<PinId>, level: f64) {
        lock(&self.state).analog_levels.insert(channel.into(), level);
    }

    /// Raw count returned for a sonar channel.
    pub fn set_analog_raw(&self, channel: impl Into<PinId>, raw: u16) {
        lock(&self.state).analog_raw.insert(channel.into(), raw);
    }

    /// Attach a device at `address` with the given register contents.
    pub fn attach_i2c_device(&self, address: u8, registers: &[(u8, u8)]) {
        let mut map = vec![0u8; 256];
        for &(reg, value) in registers {
            map[usize::from(reg)] = value;
        }
        lock(&self.state).i2c_devices.insert(address, map);
    }

    /// Polls before a pending read completes; `u32::MAX` never completes.
    pub fn set_i2c_latency(&self, polls: u32) {
        lock(&self.state).i2c_latency = polls;
    }

    pub fn i2c_register(&self, address: u8, register: u8) -> Option<u8> {
        lock(&self.state)
            .i2c_devices
            .get(&address)
            .map(|regs| regs[usize::from(register)])
    }

    /// Make every subsequent `write` fail with a hardware error.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Board
// ────────────────────────────────────────────────────────────────────────────

struct SimAnalogSource {
    state: Arc<Mutex<SimState>>,
}

impl AnalogSource for SimAnalogSource {
    fn read(&mut self, channel: &PinId) -> Option<f64> {
        Some(lock(&self.state).analog_levels.get(channel).copied().unwrap_or(0.0))
    }

    fn read_raw(&mut self, channel: &PinId) -> Option<u16> {
        Some(lock(&self.state).analog_raw.get(channel).copied().unwrap_or(0))
    }
}

pub struct SimBoard {
    platform: Platform,
    capabilities: Capabilities,
    state: Arc<Mutex<SimState>>,
    analog_reader: Option<AnalogReader>,
    analog_interval: Duration,
}

impl SimBoard {
    fn new(platform: Platform, capabilities: Capabilities) -> Self {
        let state = SimState {
            i2c_latency: DEFAULT_I2C_LATENCY,
            ..SimState::default()
        };
        Self {
            platform,
            capabilities,
            state: Arc::new(Mutex::new(state)),
            analog_reader: None,
            analog_interval: DEFAULT_INTERVAL,
        }
    }

    /// An Arduino Uno as described by its Firmata capability report.
    pub fn arduino_uno() -> Self {
        let (report, analog_map) = uno_capability_report();
        Self::new(Platform::Arduino, Capabilities::from_firmata(&report, &analog_map))
    }

    pub fn beaglebone_black(polarity: ServoPolarity) -> Self {
        Self::new(Platform::BeagleBone { polarity }, Capabilities::beaglebone_black())
    }

    pub fn raspberry_pi() -> Self {
        Self::new(Platform::RaspberryPi, Capabilities::raspberry_pi())
    }

    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Arduino => Self::arduino_uno(),
            Platform::BeagleBone { polarity } => Self::beaglebone_black(polarity),
            Platform::RaspberryPi => Self::raspberry_pi(),
        }
    }

    pub fn with_analog_interval(mut self, interval: Duration) -> Self {
        self.analog_interval = interval;
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&self, op: SimOp) {
        lock(&self.state).ops.push(op);
    }

    fn reader(&mut self, sink: Arc<dyn ReportSink>) -> Result<&AnalogReader, BackplaneError> {
        if self.analog_reader.is_none() {
            let source = SimAnalogSource {
                state: Arc::clone(&self.state),
            };
            self.analog_reader = Some(AnalogReader::spawn(source, sink, self.analog_interval)?);
        }
        self.analog_reader.as_ref().ok_or_else(|| BackplaneError::Hardware {
            component: "analog-reader".into(),
            details: "reader unavailable".into(),
        })
    }
}

impl PinDriver for SimBoard {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn discover(&mut self) -> Result<Capabilities, BackplaneError> {
        debug!(platform = %self.platform, pins = self.capabilities.digital.len(), "sim discovery");
        Ok(self.capabilities.clone())
    }

    fn enable(
        &mut self,
        bank: Bank,
        pin: &PinId,
        mode: PinMode,
        sink: Arc<dyn ReportSink>,
    ) -> Result<(), BackplaneError> {
        self.record(SimOp::Enable {
            bank,
            pin: pin.clone(),
            mode,
        });
        match (bank, mode) {
            (Bank::Analog, PinMode::Analog | PinMode::Sonar) => {
                self.reader(sink)?.enable(pin.clone(), mode);
            }
            (Bank::Digital, PinMode::Input | PinMode::Sonar) => {
                lock(&self.state).inputs.insert(pin.clone(), sink);
            }
            _ => {}
        }
        Ok(())
    }

    fn disable(&mut self, bank: Bank, pin: &PinId, mode: PinMode) -> Result<(), BackplaneError> {
        self.record(SimOp::Disable {
            bank,
            pin: pin.clone(),
            mode,
        });
        match bank {
            Bank::Analog => {
                if let Some(reader) = &self.analog_reader {
                    reader.disable(pin.clone());
                }
            }
            Bank::Digital => {
                lock(&self.state).inputs.remove(pin);
            }
        }
        Ok(())
    }

    fn write(&mut self, pin: &PinId, output: PinOutput) -> Result<(), BackplaneError> {
        if lock(&self.state).fail_writes {
            return Err(BackplaneError::Hardware {
                component: format!("pin {pin}"),
                details: "simulated write failure".into(),
            });
        }
        self.record(SimOp::Write {
            pin: pin.clone(),
            output,
        });
        Ok(())
    }

    fn read(&mut self, bank: Bank, pin: &PinId) -> Result<FieldValue, BackplaneError> {
        let state = lock(&self.state);
        Ok(match bank {
            Bank::Digital => FieldValue::Int(state.digital_values.get(pin).copied().unwrap_or(0)),
            Bank::Analog => FieldValue::Float(state.analog_levels.get(pin).copied().unwrap_or(0.0)),
        })
    }

    fn i2c_request(&mut self, request: I2cRequest) -> Result<I2cOutcome, BackplaneError> {
        if !self.capabilities.i2c {
            return Err(BackplaneError::Hardware {
                component: format!("i2c@{}", request.address()),
                details: format!("{} has no i2c bus", self.platform),
            });
        }
        self.record(SimOp::I2c(request));
        let mut state = lock(&self.state);
        match request {
            I2cRequest::Init { .. } => Ok(I2cOutcome::Done),
            I2cRequest::WriteByte {
                address,
                register,
                value,
            } => {
                if let Some(regs) = state.i2c_devices.get_mut(&address) {
                    regs[usize::from(register)] = value;
                }
                Ok(I2cOutcome::Done)
            }
            I2cRequest::ReadBlock {
                address,
                register,
                num_bytes,
            } => {
                let bytes = match state.i2c_devices.get(&address) {
                    Some(regs) => regs
                        .iter()
                        .cycle()
                        .skip(usize::from(register))
                        .take(usize::from(num_bytes))
                        .copied()
                        .collect(),
                    None => vec![0; usize::from(num_bytes)],
                };
                let latency = state.i2c_latency;
                state.pending_reply = Some((latency, bytes));
                Ok(I2cOutcome::Pending)
            }
        }
    }

    fn poll_i2c_reply(&mut self) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        match state.pending_reply.as_mut() {
            Some((0, _)) => state.pending_reply.take().map(|(_, bytes)| bytes),
            Some((remaining, _)) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                None
            }
            None => None,
        }
    }

    fn cleanup(&mut self) {
        if let Some(mut reader) = self.analog_reader.take() {
            reader.stop();
        }
        self.record(SimOp::Cleanup);
    }
}

/// Capability report and analog map of an Arduino Uno running
/// StandardFirmata: 20 pins, PWM on 3 5 6 9 10 11, analog A0–A5 on pins
/// 14–19, i2c on 18 and 19.
pub fn uno_capability_report() -> (Vec<u8>, Vec<u8>) {
    const PWM_PINS: [u8; 6] = [3, 5, 6, 9, 10, 11];
    let mut report = Vec::new();
    let mut analog_map = Vec::new();
    for pin in 0u8..20 {
        report.extend_from_slice(&[0, 1, 1, 1]);
        if pin >= 2 {
            report.extend_from_slice(&[4, 14]);
        }
        if PWM_PINS.contains(&pin) {
            report.extend_from_slice(&[3, 8]);
        }
        if pin >= 14 {
            report.extend_from_slice(&[2, 10]);
            analog_map.push(pin - 14);
        } else {
            analog_map.push(FIRMATA_DELIMITER);
        }
        if pin >= 18 {
            report.extend_from_slice(&[6, 1]);
        }
        report.push(FIRMATA_DELIMITER);
    }
    (report, analog_map)
}
