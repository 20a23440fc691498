//! `backplane-devices` – i2c device clients
//!
//! Device drivers that live outside the bridges and reach their hardware
//! through a bridge's `i2c_request` command.
//!
//! # Modules
//!
//! - [`adxl345`] – [`Adxl345`][adxl345::Adxl345]: the ADXL345 accelerometer,
//!   with one-shot reads, a continuous background reader and optional
//!   republishing of decoded samples on a user topic.

pub mod adxl345;

pub use adxl345::{Adxl345, ContinuousReader, Sample, Target, decode_sample};
