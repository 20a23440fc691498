//! Background sampler for analog and sonar channels.
//!
//! Runs on its own OS thread and shares no state with the bridge: channel
//! changes arrive over an mpsc channel and samples leave through the
//! [`ReportSink`] as `analog_read` reports.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backplane_types::{BackplaneError, Command, FieldValue, Fields, PinMode};
use tracing::{debug, warn};

use crate::driver::ReportSink;
use crate::pin::PinId;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Where the reader gets its samples from.
pub trait AnalogSource: Send {
    /// Normalised reading (0.0–1.0) for `Analog` channels.
    fn read(&mut self, channel: &PinId) -> Option<f64>;
    /// Raw ADC count (millivolts) for `Sonar` channels.
    fn read_raw(&mut self, channel: &PinId) -> Option<u16>;
}

enum Control {
    Enable(PinId, PinMode),
    Disable(PinId),
    Stop,
}

pub struct AnalogReader {
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl AnalogReader {
    pub fn spawn<S>(source: S, sink: Arc<dyn ReportSink>, interval: Duration) -> Result<Self, BackplaneError>
    where
        S: AnalogSource + 'static,
    {
        let (control, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("analog-reader".into())
            .spawn(move || sample_loop(source, sink, rx, interval))
            .map_err(|e| BackplaneError::Hardware {
                component: "analog-reader".into(),
                details: e.to_string(),
            })?;
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    pub fn enable(&self, channel: PinId, mode: PinMode) {
        let _ = self.control.send(Control::Enable(channel, mode));
    }

    pub fn disable(&self, channel: PinId) {
        let _ = self.control.send(Control::Disable(channel));
    }

    pub fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("analog reader thread panicked");
        }
    }
}

impl Drop for AnalogReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop<S: AnalogSource>(
    mut source: S,
    sink: Arc<dyn ReportSink>,
    control: Receiver<Control>,
    interval: Duration,
) {
    let mut channels: Vec<(PinId, PinMode)> = Vec::new();
    loop {
        loop {
            match control.try_recv() {
                Ok(Control::Enable(channel, mode)) => {
                    channels.retain(|(c, _)| *c != channel);
                    channels.push((channel, mode));
                }
                Ok(Control::Disable(channel)) => channels.retain(|(c, _)| *c != channel),
                Ok(Control::Stop) | Err(TryRecvError::Disconnected) => {
                    debug!("analog reader stopping");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        for (channel, mode) in &channels {
            let value = match mode {
                PinMode::Sonar => source
                    .read_raw(channel)
                    .map(|raw| FieldValue::Int(sonar_distance_cm(raw).into())),
                _ => source
                    .read(channel)
                    .map(|v| FieldValue::Float((v * 10_000.0).round() / 10_000.0)),
            };
            if let Some(value) = value {
                sink.report(
                    Fields::new(Command::AnalogRead)
                        .with("pin", channel.to_string())
                        .with("value", value),
                );
            }
        }

        thread::sleep(interval);
    }
}

/// Lower voltage bound (inclusive) of each distance band, nearest first.
const SONAR_TABLE: &[(f64, u16)] = &[
    (2.083, 12),
    (1.811, 14),
    (1.620, 16),
    (1.461, 18),
    (1.310, 20),
    (1.211, 22),
    (1.099, 24),
    (1.022, 26),
    (0.965, 28),
    (0.907, 30),
    (0.851, 32),
    (0.800, 34),
    (0.757, 36),
    (0.720, 38),
    (0.695, 40),
    (0.656, 42),
    (0.639, 44),
    (0.612, 46),
    (0.593, 48),
    (0.564, 50),
    (0.543, 52),
    (0.522, 54),
    (0.503, 56),
    (0.483, 58),
    (0.464, 60),
    (0.445, 62),
    (0.428, 66),
    (0.427, 68),
    (0.413, 70),
];

/// Convert a raw sonar ADC count into centimetres (10–80).
pub fn sonar_distance_cm(raw: u16) -> u16 {
    let volts = f64::from(raw) / 1000.0 * 2.0;
    if volts > 2.45 {
        return 10;
    }
    SONAR_TABLE
        .iter()
        .find(|(lower, _)| volts >= *lower)
        .map_or(80, |&(_, cm)| cm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Fields>>);

    impl ReportSink for Collect {
        fn report(&self, fields: Fields) {
            self.0.lock().unwrap().push(fields);
        }
    }

    struct Fixed;

    impl AnalogSource for Fixed {
        fn read(&mut self, _: &PinId) -> Option<f64> {
            Some(0.123456)
        }
        fn read_raw(&mut self, _: &PinId) -> Option<u16> {
            Some(500)
        }
    }

    #[test]
    fn sonar_bands() {
        assert_eq!(sonar_distance_cm(1300), 10);
        assert_eq!(sonar_distance_cm(1225), 12);
        assert_eq!(sonar_distance_cm(1000), 14);
        assert_eq!(sonar_distance_cm(500), 28);
        assert_eq!(sonar_distance_cm(210), 70);
        assert_eq!(sonar_distance_cm(150), 80);
    }

    #[test]
    fn reports_enabled_channels_until_stopped() {
        let sink = Arc::new(Collect::default());
        let mut reader = AnalogReader::spawn(Fixed, sink.clone(), Duration::from_millis(1)).unwrap();
        reader.enable(PinId::from("P9_33"), PinMode::Analog);
        reader.enable(PinId::from("P9_35"), PinMode::Sonar);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.0.lock().unwrap().len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        reader.stop();

        let reports = sink.0.lock().unwrap().clone();
        assert!(reports.len() >= 4);
        assert!(reports.iter().all(|f| f.command() == Some("analog_read")));
        let analog = reports.iter().find(|f| f.text("pin") == Some("P9_33")).unwrap();
        assert_eq!(analog.get("value"), Some(&FieldValue::Float(0.1235)));
        let sonar = reports.iter().find(|f| f.text("pin") == Some("P9_35")).unwrap();
        assert_eq!(sonar.int("value"), Some(28));
    }

    #[test]
    fn disabled_channel_goes_quiet() {
        let sink = Arc::new(Collect::default());
        let mut reader = AnalogReader::spawn(Fixed, sink.clone(), Duration::from_millis(1)).unwrap();
        reader.enable(PinId::Index(0), PinMode::Analog);
        reader.disable(PinId::Index(0));
        thread::sleep(Duration::from_millis(30));
        let settled = sink.0.lock().unwrap().len();
        thread::sleep(Duration::from_millis(30));
        reader.stop();
        assert_eq!(sink.0.lock().unwrap().len(), settled);
    }
}
