//! `backplane-hal` – Pin-level hardware abstraction for bridges
//!
//! Everything a bridge needs to know about the board on the other side of
//! it, without knowing what transport the commands arrived on.
//!
//! # Modules
//!
//! - [`pin`] – [`PinId`], [`Bank`] and the [`PinTable`] built once from the
//!   capability probe and never grown afterwards.
//! - [`capability`] – Firmata capability-report parsing plus the fixed
//!   BeagleBone Black and Raspberry Pi layouts.
//! - [`platform`] – per-platform pin naming, PWM ranges and servo signal
//!   mapping.
//! - [`driver`] – the [`PinDriver`] trait every board implements and the
//!   [`ReportSink`] it pushes input changes through.
//! - [`analog_reader`] – a background sampler thread for analog and sonar
//!   channels.
//! - [`sim`] – in-process simulated boards for headless runs and tests.

pub mod analog_reader;
pub mod capability;
pub mod driver;
pub mod pin;
pub mod platform;
pub mod sim;

pub use analog_reader::{AnalogReader, AnalogSource, sonar_distance_cm};
pub use capability::Capabilities;
pub use driver::{I2cOutcome, I2cRequest, PinDriver, PinOutput, ReportSink};
pub use pin::{Bank, ModeSet, PinId, PinState, PinTable};
pub use platform::{Platform, ServoOutput, ServoPolarity};
pub use sim::{SimBoard, SimHandle, SimOp};
