//! ADXL345 three-axis accelerometer over the bridges' i2c commands.
//!
//! The client never talks to a bus directly: it publishes `i2c_request`
//! commands to one board (`A<n>`) or every board with an i2c bus (`Q`) and
//! decodes the `i2c_reply` the bridge sends back on `B<n>`.
//!
//! | Step | Requests |
//! |---|---|
//! | init | `init`; `POWER_CTL`(45) ← 0, ← 8 (measure); `DATA_FORMAT`(49) ← 8 (full resolution), ← 3 (±16 g) |
//! | read | `read_block` `DATAX0`(50), 6 bytes |
//!
//! Each axis is a 10-bit two's complement value at 4 mg/LSB.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use backplane_middleware::{Publisher, Subscriber, codec};
use backplane_types::{BackplaneError, Command, FieldValue, Fields, Message, Topic};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const ADXL345_ADDRESS: u8 = 83;
pub const EARTH_GRAVITY_MS2: f64 = 9.80665;

const REG_POWER_CTL: u8 = 45;
const REG_DATA_FORMAT: u8 = 49;
const REG_DATAX0: u8 = 50;
const SAMPLE_BYTES: u8 = 6;
const G_PER_LSB: f64 = 0.004;
const POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Default wait for one `read_block` reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Command value carried by republished samples.
pub const SAMPLE_COMMAND: &str = "adxl345";

/// One decoded reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Sample {
    pub board: u16,
    pub x_raw: i16,
    pub y_raw: i16,
    pub z_raw: i16,
    /// Acceleration in g.
    pub x_g: f64,
    pub y_g: f64,
    pub z_g: f64,
    /// Acceleration in m/s².
    pub x_a: f64,
    pub y_a: f64,
    pub z_a: f64,
    /// Degrees, truncated toward zero.
    pub pitch: i32,
    pub roll: i32,
}

impl Sample {
    /// Payload for republishing this sample on a user topic.
    pub fn to_fields(&self) -> Fields {
        Fields::empty()
            .with(Fields::COMMAND, SAMPLE_COMMAND)
            .with("board", self.board)
            .with("x_raw", i64::from(self.x_raw))
            .with("y_raw", i64::from(self.y_raw))
            .with("z_raw", i64::from(self.z_raw))
            .with("x_g", self.x_g)
            .with("y_g", self.y_g)
            .with("z_g", self.z_g)
            .with("x_a", self.x_a)
            .with("y_a", self.y_a)
            .with("z_a", self.z_a)
            .with("pitch", self.pitch)
            .with("roll", self.roll)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn axis(low: u8, high: u8) -> i16 {
    let value = u16::from(low) | (u16::from(high & 0x3) << 8);
    if value & 0x200 != 0 {
        value as i16 - 0x400
    } else {
        value as i16
    }
}

/// Decode the six `DATAX0..DATAZ1` bytes of a `read_block` reply.
///
/// # Errors
///
/// [`BackplaneError::Device`] when fewer than six bytes are given.
pub fn decode_sample(board: u16, raw: &[u8]) -> Result<Sample, BackplaneError> {
    let &[x0, x1, y0, y1, z0, z1, ..] = raw else {
        return Err(BackplaneError::Device(format!(
            "adxl345 reply has {} bytes, expected {SAMPLE_BYTES}",
            raw.len()
        )));
    };
    let (x_raw, y_raw, z_raw) = (axis(x0, x1), axis(y0, y1), axis(z0, z1));
    let g = |raw: i16| round4(f64::from(raw) * G_PER_LSB);
    let (x_g, y_g, z_g) = (g(x_raw), g(y_raw), g(z_raw));
    let (x_a, y_a, z_a) = (
        round4(x_g * EARTH_GRAVITY_MS2),
        round4(y_g * EARTH_GRAVITY_MS2),
        round4(z_g * EARTH_GRAVITY_MS2),
    );
    let pitch = (-x_a.atan2((y_a * y_a + z_a * z_a).sqrt())).to_degrees() as i32;
    let roll = y_a.atan2(z_a).to_degrees() as i32;

    Ok(Sample {
        board,
        x_raw,
        y_raw,
        z_raw,
        x_g,
        y_g,
        z_g,
        x_a,
        y_a,
        z_a,
        pitch,
        roll,
    })
}

fn request(cmd: &str) -> Fields {
    Fields::new(Command::I2cRequest)
        .with("cmd", cmd)
        .with("device_address", ADXL345_ADDRESS)
}

/// Requests that power the device up in ±16 g measurement mode.
pub fn init_sequence() -> Vec<Fields> {
    let write = |register: u8, value: u8| {
        request("write_byte")
            .with("register", register)
            .with("value", value)
    };
    vec![
        request("init"),
        write(REG_POWER_CTL, 0),
        write(REG_POWER_CTL, 8),
        write(REG_DATA_FORMAT, 8),
        write(REG_DATA_FORMAT, 3),
    ]
}

/// The single request that reads all three axes.
pub fn read_request() -> Fields {
    request("read_block")
        .with("register", REG_DATAX0)
        .with("num_bytes", SAMPLE_BYTES)
}

/// Which bridges the client addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Board(u16),
    /// Every bridge with an i2c bus, via `Q`.
    Broadcast,
}

impl Target {
    pub fn topic(self) -> Topic {
        match self {
            Target::Board(board) => Topic::command(board),
            Target::Broadcast => Topic::broadcast(),
        }
    }

    fn accepts(self, board: u16) -> bool {
        match self {
            Target::Board(n) => n == board,
            Target::Broadcast => true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

pub struct Adxl345 {
    target: Target,
    publisher: Publisher,
    subscriber: Subscriber,
    republish: Option<Topic>,
    last: Arc<Mutex<Sample>>,
}

impl Adxl345 {
    /// `publisher` reaches the router's publish side and `subscriber` its
    /// subscribe side. The subscriber is filtered to board reports (`B`).
    pub fn new(target: Target, publisher: Publisher, mut subscriber: Subscriber) -> Self {
        subscriber.subscribe(Topic::new([Topic::REPORT_PREFIX]));
        Self {
            target,
            publisher,
            subscriber,
            republish: None,
            last: Arc::new(Mutex::new(Sample::default())),
        }
    }

    /// Also publish every decoded sample on `topic`.
    pub fn with_republish(mut self, topic: impl Into<Topic>) -> Self {
        self.republish = Some(topic.into());
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    fn send(&self, fields: &Fields) -> Result<(), BackplaneError> {
        let message = codec::encode(self.target.topic(), fields)?;
        self.publisher.send(message);
        Ok(())
    }

    pub fn initialize(&self) -> Result<(), BackplaneError> {
        for fields in init_sequence() {
            self.send(&fields)?;
        }
        info!(topic = %self.target.topic(), address = ADXL345_ADDRESS, "adxl345 initialised");
        Ok(())
    }

    /// Request one sample and wait up to `timeout` for the reply.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::Device`] on timeout, or a transport error if the
    /// report subscription closed.
    pub fn read_once(&mut self, timeout: Duration) -> Result<Sample, BackplaneError> {
        self.send(&read_request())?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.subscriber.try_recv()? {
                Some(message) => {
                    if let Some(sample) = self.accept(&message) {
                        return Ok(sample);
                    }
                }
                None if Instant::now() >= deadline => {
                    return Err(BackplaneError::Device(format!(
                        "no adxl345 reply within {timeout:?}"
                    )));
                }
                None => thread::sleep(POLL_QUANTUM),
            }
        }
    }

    /// The most recent sample, from a one-shot or continuous read.
    pub fn last_data(&self) -> Sample {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(&self, message: &Message) -> Option<Sample> {
        let board = message.topic.board()?;
        if !self.target.accepts(board) {
            return None;
        }
        let (_, fields) = codec::decode(message).ok()?;
        let Some(FieldValue::Bytes(data)) = fields.get("data") else {
            return None;
        };
        let sample = match decode_sample(board, data) {
            Ok(sample) => sample,
            Err(e) => {
                debug!(board, error = %e, "ignoring reply");
                return None;
            }
        };
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = sample;

        if let Some(topic) = &self.republish {
            match codec::encode(topic.clone(), &sample.to_fields()) {
                Ok(message) => {
                    self.publisher.send(message);
                }
                Err(e) => warn!(error = %e, "sample could not be republished"),
            }
        }
        Some(sample)
    }

    /// Move the client onto a background thread that reads continuously.
    pub fn start_continuous(
        self,
        interval: Option<Duration>,
        callback: Option<Box<dyn Fn(&Sample) + Send>>,
    ) -> Result<ContinuousReader, BackplaneError> {
        ContinuousReader::spawn(self, interval, callback)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Continuous reading
// ────────────────────────────────────────────────────────────────────────────

/// Background reader. Pausing keeps the thread alive; [`stop`](Self::stop)
/// ends it and hands the client back.
pub struct ContinuousReader {
    keep_reading: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    last: Arc<Mutex<Sample>>,
    handle: Option<JoinHandle<Adxl345>>,
}

impl ContinuousReader {
    fn spawn(
        mut device: Adxl345,
        interval: Option<Duration>,
        callback: Option<Box<dyn Fn(&Sample) + Send>>,
    ) -> Result<Self, BackplaneError> {
        let keep_reading = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let last = Arc::clone(&device.last);

        let (keep, halt) = (Arc::clone(&keep_reading), Arc::clone(&stop));
        let handle = thread::Builder::new()
            .name("adxl345-reader".into())
            .spawn(move || {
                while !halt.load(Ordering::Relaxed) {
                    if !keep.load(Ordering::Relaxed) {
                        thread::sleep(POLL_QUANTUM);
                        continue;
                    }
                    match device.read_once(DEFAULT_READ_TIMEOUT) {
                        Ok(sample) => {
                            if let Some(callback) = &callback {
                                callback(&sample);
                            }
                        }
                        Err(BackplaneError::Transport(e)) => {
                            warn!(error = %e, "report subscription closed; reader stopping");
                            break;
                        }
                        Err(e) => warn!(error = %e, "adxl345 read failed"),
                    }
                    thread::sleep(interval.unwrap_or(POLL_QUANTUM));
                }
                device
            })
            .map_err(|e| BackplaneError::Device(e.to_string()))?;

        Ok(Self {
            keep_reading,
            stop,
            last,
            handle: Some(handle),
        })
    }

    pub fn pause(&self) {
        self.keep_reading.store(false, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.keep_reading.store(true, Ordering::Relaxed);
    }

    pub fn is_reading(&self) -> bool {
        self.keep_reading.load(Ordering::Relaxed)
    }

    pub fn last_data(&self) -> Sample {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the thread and return the client.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::Device`] if the reader thread panicked.
    pub fn stop(mut self) -> Result<Adxl345, BackplaneError> {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| BackplaneError::Device("reader already stopped".into()))?;
        handle
            .join()
            .map_err(|_| BackplaneError::Device("adxl345 reader thread panicked".into()))
    }
}

impl Drop for ContinuousReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("adxl345 reader thread panicked");
        }
    }
}
