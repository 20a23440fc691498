//! The bridge command set.
//!
//! Every handler validates in the same order: parse the pin, check it was
//! discovered, check its configured mode, check it is enabled, parse the
//! value, check the value's range, and only then call the driver. The first
//! failed check decides the problem code and the driver is never touched.
//! A driver that fails after validation is logged; the caller gets no
//! problem report for it.

use std::collections::BTreeSet;
use std::sync::Arc;

use backplane_hal::{
    Bank, Capabilities, I2cOutcome, I2cRequest, PinDriver, PinId, PinOutput, PinState, PinTable,
    Platform, ReportSink,
};
use backplane_hal::platform::SERVO_MAX_DEGREES;
use backplane_types::{BackplaneError, Command, Enable, FieldValue, Fields, PinMode, ProblemReport};
use tracing::{debug, warn};

use crate::problem::codes::*;
use crate::registry::CommandRegistry;

/// Largest block an `i2c_request` `read_block` may ask for.
pub const I2C_MAX_BLOCK: i64 = 32;

/// State a bridge's handlers operate on. Owned by the bridge loop alone.
pub struct BridgeContext {
    board: u16,
    platform: Platform,
    pins: PinTable,
    driver: Box<dyn PinDriver>,
    sink: Arc<dyn ReportSink>,
    i2c_bus: bool,
    i2c_devices: BTreeSet<u8>,
    i2c_pending: Option<u8>,
}

/// The three checks shared by every output command.
struct OutputChecks {
    invalid_pin: ProblemReport,
    wrong_mode: ProblemReport,
    disabled: ProblemReport,
}

impl BridgeContext {
    /// Run the driver's capability probe and build the pin table.
    pub fn discover(
        board: u16,
        mut driver: Box<dyn PinDriver>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self, BackplaneError> {
        let caps: Capabilities = driver.discover()?;
        debug!(
            board,
            digital = caps.digital.len(),
            analog = caps.analog.len(),
            i2c = caps.i2c,
            "capabilities discovered"
        );
        Ok(Self {
            board,
            platform: driver.platform(),
            pins: PinTable::from_capabilities(&caps),
            driver,
            sink,
            i2c_bus: caps.i2c,
            i2c_devices: BTreeSet::new(),
            i2c_pending: None,
        })
    }

    pub fn board(&self) -> u16 {
        self.board
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn pins(&self) -> &PinTable {
        &self.pins
    }

    pub fn has_i2c(&self) -> bool {
        self.i2c_bus
    }

    /// Whether the last command left an i2c read in flight.
    pub fn i2c_pending(&self) -> bool {
        self.i2c_pending.is_some()
    }

    /// Reply for the in-flight read, clearing it once it arrives.
    pub fn poll_i2c_reply(&mut self) -> Option<Vec<u8>> {
        self.i2c_pending?;
        let reply = self.driver.poll_i2c_reply();
        if reply.is_some() {
            self.i2c_pending = None;
        }
        reply
    }

    /// Give up on the in-flight read. Returns its device address.
    pub fn abandon_i2c(&mut self) -> Option<u8> {
        self.i2c_pending.take()
    }

    pub fn cleanup(&mut self) {
        self.driver.cleanup();
    }

    fn pin(&self, fields: &Fields, invalid: ProblemReport) -> Result<PinId, ProblemReport> {
        fields
            .get("pin")
            .and_then(|raw| self.platform.parse_pin(raw))
            .ok_or(invalid)
    }

    fn state(&self, bank: Bank, pin: &PinId, invalid: ProblemReport) -> Result<PinState, ProblemReport> {
        self.pins.get(bank, pin).copied().ok_or(invalid)
    }

    fn output_pin(&self, fields: &Fields, mode: PinMode, checks: OutputChecks) -> Result<PinId, ProblemReport> {
        let pin = self.pin(fields, checks.invalid_pin)?;
        let state = self.state(Bank::Digital, &pin, checks.invalid_pin)?;
        if state.mode != mode {
            return Err(checks.wrong_mode);
        }
        if !state.enabled {
            return Err(checks.disabled);
        }
        Ok(pin)
    }

    fn drive(&mut self, pin: &PinId, output: PinOutput) -> Result<(), ProblemReport> {
        if let Err(e) = self.driver.write(pin, output) {
            warn!(board = self.board, %pin, error = %e, "driver write failed");
        }
        Ok(())
    }

    fn enable_pin(&mut self, bank: Bank, pin: &PinId, previous: PinState, mode: PinMode) -> Result<(), ProblemReport> {
        if previous.enabled
            && previous.mode != mode
            && let Err(e) = self.driver.disable(bank, pin, previous.mode)
        {
            warn!(board = self.board, %pin, error = %e, "driver disable failed");
        }
        if let Err(e) = self.driver.enable(bank, pin, mode, Arc::clone(&self.sink)) {
            warn!(board = self.board, %pin, %mode, error = %e, "driver enable failed");
            return Ok(());
        }
        self.pins.configure(bank, pin, mode);

        let report = match mode {
            PinMode::Input => Command::DigitalRead,
            PinMode::Analog => Command::AnalogRead,
            _ => return Ok(()),
        };
        match self.driver.read(bank, pin) {
            Ok(value) => self.sink.report(
                Fields::new(report)
                    .with("pin", pin.to_string())
                    .with("value", value),
            ),
            Err(e) => warn!(board = self.board, %pin, error = %e, "initial read failed"),
        }
        Ok(())
    }

    fn disable_pin(&mut self, bank: Bank, pin: &PinId, mode: PinMode) -> Result<(), ProblemReport> {
        if let Err(e) = self.driver.disable(bank, pin, mode) {
            warn!(board = self.board, %pin, error = %e, "driver disable failed");
        }
        self.pins.disable(bank, pin);
        Ok(())
    }
}

/// Register the full command set.
pub fn register_all(registry: &mut CommandRegistry<BridgeContext>) {
    registry.register(Command::DigitalPinMode, digital_pin_mode);
    registry.register(Command::AnalogPinMode, analog_pin_mode);
    registry.register(Command::DigitalWrite, digital_write);
    registry.register(Command::AnalogWrite, analog_write);
    registry.register(Command::PlayTone, play_tone);
    registry.register(Command::ToneOff, tone_off);
    registry.register(Command::SetServoPosition, set_servo_position);
    registry.register(Command::I2cRequest, i2c_request);
}

fn unsupported(mode: PinMode) -> ProblemReport {
    match mode {
        PinMode::Input => PIN_MODE_INPUT_UNSUPPORTED,
        PinMode::Output => PIN_MODE_OUTPUT_UNSUPPORTED,
        PinMode::Pwm => PIN_MODE_PWM_UNSUPPORTED,
        PinMode::Servo => PIN_MODE_SERVO_UNSUPPORTED,
        PinMode::Tone => PIN_MODE_TONE_UNSUPPORTED,
        PinMode::Sonar => PIN_MODE_SONAR_UNSUPPORTED,
        PinMode::Unset | PinMode::Analog => PIN_MODE_UNKNOWN_MODE,
    }
}

fn mode_bank(ctx: &BridgeContext, mode: Option<PinMode>) -> Bank {
    match mode {
        Some(PinMode::Sonar) => ctx.platform.sonar_bank(),
        _ => Bank::Digital,
    }
}

/// Bank holding the pin's configuration, so a disable without `mode` still
/// finds a sonar pin that lives outside the digital bank.
fn configured_bank(ctx: &BridgeContext, pin: &PinId, mode: Option<PinMode>) -> Bank {
    let configured = |bank: Bank| ctx.pins.get(bank, pin).is_some_and(|s| s.mode != PinMode::Unset);
    let sonar = ctx.platform.sonar_bank();
    if configured(Bank::Digital) {
        Bank::Digital
    } else if sonar != Bank::Digital && ctx.pins.get(sonar, pin).is_some_and(|s| s.mode == PinMode::Sonar) {
        sonar
    } else {
        mode_bank(ctx, mode)
    }
}

pub fn digital_pin_mode(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.pin(fields, PIN_MODE_INVALID_PIN)?;
    let enable = fields
        .text("enable")
        .and_then(Enable::from_wire)
        .ok_or(PIN_MODE_INVALID_ENABLE)?;
    let mode = fields.text("mode").and_then(PinMode::from_wire);

    match enable {
        Enable::Enable => {
            let bank = mode_bank(ctx, mode);
            let mode = mode
                .filter(|m| *m != PinMode::Analog)
                .ok_or(PIN_MODE_UNKNOWN_MODE)?;
            let state = ctx.state(bank, &pin, PIN_MODE_INVALID_PIN)?;
            if !state.supported.contains(mode) {
                return Err(unsupported(mode));
            }
            ctx.enable_pin(bank, &pin, state, mode)
        }
        Enable::Disable => {
            let bank = configured_bank(ctx, &pin, mode);
            let state = ctx.state(bank, &pin, PIN_MODE_INVALID_PIN)?;
            if state.mode == PinMode::Unset {
                return Err(PIN_MODE_NOT_CONFIGURED);
            }
            ctx.disable_pin(bank, &pin, state.mode)
        }
    }
}

pub fn analog_pin_mode(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.pin(fields, ANALOG_MODE_INVALID_PIN)?;
    let enable = fields
        .text("enable")
        .and_then(Enable::from_wire)
        .ok_or(ANALOG_MODE_INVALID_ENABLE)?;
    let state = ctx.state(Bank::Analog, &pin, ANALOG_MODE_INVALID_PIN)?;
    if !state.supported.contains(PinMode::Analog) {
        return Err(ANALOG_MODE_INVALID_PIN);
    }
    match enable {
        Enable::Enable => ctx.enable_pin(Bank::Analog, &pin, state, PinMode::Analog),
        Enable::Disable if state.mode == PinMode::Unset => {
            debug!(board = ctx.board, %pin, "analog pin was never enabled");
            Ok(())
        }
        Enable::Disable => ctx.disable_pin(Bank::Analog, &pin, state.mode),
    }
}

pub fn digital_write(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.output_pin(
        fields,
        PinMode::Output,
        OutputChecks {
            invalid_pin: DIGITAL_WRITE_INVALID_PIN,
            wrong_mode: DIGITAL_WRITE_WRONG_MODE,
            disabled: DIGITAL_WRITE_DISABLED,
        },
    )?;
    let level = fields
        .get("value")
        .and_then(FieldValue::parse_int)
        .filter(|v| *v == 0 || *v == 1)
        .ok_or(DIGITAL_WRITE_INVALID_VALUE)?;
    ctx.drive(&pin, PinOutput::Digital(level == 1))
}

pub fn analog_write(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.output_pin(
        fields,
        PinMode::Pwm,
        OutputChecks {
            invalid_pin: ANALOG_WRITE_INVALID_PIN,
            wrong_mode: ANALOG_WRITE_WRONG_MODE,
            disabled: ANALOG_WRITE_DISABLED,
        },
    )?;
    let value = fields
        .get("value")
        .and_then(|raw| ctx.platform.parse_pwm(raw))
        .ok_or(ANALOG_WRITE_INVALID_VALUE)?;
    if !(0.0..=ctx.platform.pwm_max()).contains(&value) {
        return Err(ANALOG_WRITE_OUT_OF_RANGE);
    }
    ctx.drive(&pin, PinOutput::Pwm(value))
}

pub fn play_tone(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.output_pin(
        fields,
        PinMode::Tone,
        OutputChecks {
            invalid_pin: TONE_INVALID_PIN,
            wrong_mode: TONE_WRONG_MODE,
            disabled: TONE_DISABLED,
        },
    )?;
    let frequency = fields
        .get("frequency")
        .and_then(FieldValue::parse_int)
        .filter(|f| *f > 0)
        .and_then(|f| u32::try_from(f).ok())
        .ok_or(TONE_INVALID_FREQUENCY)?;
    let duration_ms = fields
        .get("duration")
        .and_then(FieldValue::parse_int)
        .and_then(|d| u32::try_from(d).ok())
        .ok_or(TONE_INVALID_DURATION)?;
    ctx.drive(&pin, PinOutput::Tone { frequency, duration_ms })
}

pub fn tone_off(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.output_pin(
        fields,
        PinMode::Tone,
        OutputChecks {
            invalid_pin: TONE_OFF_INVALID_PIN,
            wrong_mode: TONE_OFF_WRONG_MODE,
            disabled: TONE_OFF_DISABLED,
        },
    )?;
    ctx.drive(&pin, PinOutput::ToneOff)
}

pub fn set_servo_position(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    let pin = ctx.output_pin(
        fields,
        PinMode::Servo,
        OutputChecks {
            invalid_pin: SERVO_INVALID_PIN,
            wrong_mode: SERVO_WRONG_MODE,
            disabled: SERVO_DISABLED,
        },
    )?;
    let position = fields
        .get("position")
        .and_then(FieldValue::parse_int)
        .ok_or(SERVO_INVALID_POSITION)?;
    let degrees = u8::try_from(position)
        .ok()
        .filter(|_| (0..=SERVO_MAX_DEGREES).contains(&position))
        .ok_or(SERVO_OUT_OF_RANGE)?;
    let output = ctx.platform.servo_output(degrees);
    ctx.drive(&pin, PinOutput::Servo(output))
}

fn byte_field(fields: &Fields, key: &str) -> Result<u8, ProblemReport> {
    fields
        .get(key)
        .and_then(FieldValue::parse_int)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or(I2C_INVALID_ARGUMENT)
}

pub fn i2c_request(ctx: &mut BridgeContext, fields: &Fields) -> Result<(), ProblemReport> {
    if !ctx.i2c_bus {
        return Err(I2C_UNSUPPORTED);
    }
    let address = fields
        .get("device_address")
        .and_then(FieldValue::parse_int)
        .and_then(|a| u8::try_from(a).ok())
        .filter(|a| *a <= 0x7f)
        .ok_or(I2C_INVALID_ADDRESS)?;
    let cmd = fields.text("cmd").map(str::trim);
    if matches!(cmd, Some("write_byte" | "read_block")) && !ctx.i2c_devices.contains(&address) {
        return Err(I2C_NOT_INITIALIZED);
    }

    let request = match cmd {
        Some("init") => I2cRequest::Init { address },
        Some("write_byte") => I2cRequest::WriteByte {
            address,
            register: byte_field(fields, "register")?,
            value: byte_field(fields, "value")?,
        },
        Some("read_block") => {
            let register = byte_field(fields, "register")?;
            let num_bytes = fields
                .get("num_bytes")
                .and_then(FieldValue::parse_int)
                .filter(|n| (1..=I2C_MAX_BLOCK).contains(n))
                .and_then(|n| u8::try_from(n).ok())
                .ok_or(I2C_INVALID_ARGUMENT)?;
            I2cRequest::ReadBlock {
                address,
                register,
                num_bytes,
            }
        }
        _ => return Err(I2C_UNKNOWN_CMD),
    };

    match ctx.driver.i2c_request(request) {
        Ok(I2cOutcome::Done) => {
            if let I2cRequest::Init { address } = request {
                ctx.i2c_devices.insert(address);
            }
        }
        Ok(I2cOutcome::Pending) => ctx.i2c_pending = Some(address),
        Err(e) => warn!(board = ctx.board, address, error = %e, "i2c request failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_hal::{ServoOutput, ServoPolarity, SimBoard, SimHandle};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Fields>>);

    impl ReportSink for Collect {
        fn report(&self, fields: Fields) {
            self.0.lock().unwrap().push(fields);
        }
    }

    fn context(board: SimBoard) -> (BridgeContext, SimHandle, Arc<Collect>) {
        let handle = board.handle();
        let sink = Arc::new(Collect::default());
        let ctx = BridgeContext::discover(1, Box::new(board), sink.clone()).unwrap();
        (ctx, handle, sink)
    }

    fn pin_mode(pin: &str, mode: &str) -> Fields {
        Fields::new(Command::DigitalPinMode)
            .with("enable", "Enable")
            .with("pin", pin)
            .with("mode", mode)
    }

    #[test]
    fn pin_mode_checks_capabilities() {
        let (mut ctx, _, _) = context(SimBoard::arduino_uno());
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("4", "PWM")), Err(PIN_MODE_PWM_UNSUPPORTED));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("0", "Servo")), Err(PIN_MODE_SERVO_UNSUPPORTED));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("0", "Tone")), Err(PIN_MODE_TONE_UNSUPPORTED));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("40", "Output")), Err(PIN_MODE_INVALID_PIN));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("x", "Output")), Err(PIN_MODE_INVALID_PIN));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("4", "Blink")), Err(PIN_MODE_UNKNOWN_MODE));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("4", "Analog")), Err(PIN_MODE_UNKNOWN_MODE));
        let bad_enable = pin_mode("4", "Output").with("enable", "maybe");
        assert_eq!(digital_pin_mode(&mut ctx, &bad_enable), Err(PIN_MODE_INVALID_ENABLE));
    }

    #[test]
    fn sonar_follows_platform_bank() {
        let (mut ctx, _, _) = context(SimBoard::raspberry_pi());
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("4", "SONAR")), Err(PIN_MODE_SONAR_UNSUPPORTED));

        let (mut ctx, _, _) = context(SimBoard::beaglebone_black(ServoPolarity::Inverted));
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("P9_35", "sonar")), Ok(()));
        let state = ctx.pins().get(Bank::Analog, &PinId::from("P9_35")).unwrap();
        assert_eq!(state.mode, PinMode::Sonar);
        assert!(state.enabled);
        assert_eq!(digital_pin_mode(&mut ctx, &pin_mode("P9_14", "SONAR")), Err(PIN_MODE_INVALID_PIN));
        ctx.cleanup();
    }

    #[test]
    fn sonar_disable_without_mode_finds_the_analog_bank() {
        let (mut ctx, _, _) = context(SimBoard::beaglebone_black(ServoPolarity::Inverted));
        digital_pin_mode(&mut ctx, &pin_mode("P9_35", "SONAR")).unwrap();

        let disable = Fields::new(Command::DigitalPinMode)
            .with("enable", "Disable")
            .with("pin", "P9_35");
        assert_eq!(digital_pin_mode(&mut ctx, &disable), Ok(()));
        let state = ctx.pins().get(Bank::Analog, &PinId::from("P9_35")).unwrap();
        assert_eq!(state.mode, PinMode::Sonar);
        assert!(!state.enabled);

        let never_configured = disable.clone().with("pin", "P9_36");
        assert_eq!(digital_pin_mode(&mut ctx, &never_configured), Err(PIN_MODE_INVALID_PIN));
        ctx.cleanup();
    }

    #[test]
    fn disable_requires_a_configured_pin() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        let disable = pin_mode("13", "Output").with("enable", "Disable");
        assert_eq!(digital_pin_mode(&mut ctx, &disable), Err(PIN_MODE_NOT_CONFIGURED));

        digital_pin_mode(&mut ctx, &pin_mode("13", "Output")).unwrap();
        digital_pin_mode(&mut ctx, &disable).unwrap();
        let state = ctx.pins().get(Bank::Digital, &PinId::Index(13)).unwrap();
        assert_eq!(state.mode, PinMode::Output);
        assert!(!state.enabled);

        let write = Fields::new(Command::DigitalWrite).with("pin", "13").with("value", "1");
        assert_eq!(digital_write(&mut ctx, &write), Err(DIGITAL_WRITE_DISABLED));
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn digital_write_value_must_be_a_level() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        digital_pin_mode(&mut ctx, &pin_mode("13", "Output")).unwrap();
        for bad in ["2", "-1", "high", "0.5"] {
            let write = Fields::new(Command::DigitalWrite).with("pin", "13").with("value", bad);
            assert_eq!(digital_write(&mut ctx, &write), Err(DIGITAL_WRITE_INVALID_VALUE), "{bad}");
        }
        let write = Fields::new(Command::DigitalWrite).with("pin", 13i64).with("value", 0i64);
        digital_write(&mut ctx, &write).unwrap();
        assert_eq!(handle.writes(), vec![(PinId::Index(13), PinOutput::Digital(false))]);
    }

    #[test]
    fn analog_write_range_depends_on_platform() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        digital_pin_mode(&mut ctx, &pin_mode("3", "PWM")).unwrap();
        let write = |v: &str| Fields::new(Command::AnalogWrite).with("pin", "3").with("value", v);
        assert_eq!(analog_write(&mut ctx, &write("256")), Err(ANALOG_WRITE_OUT_OF_RANGE));
        assert_eq!(analog_write(&mut ctx, &write("12.5")), Err(ANALOG_WRITE_INVALID_VALUE));
        analog_write(&mut ctx, &write("255")).unwrap();
        assert_eq!(handle.writes(), vec![(PinId::Index(3), PinOutput::Pwm(255.0))]);

        let (mut ctx, handle, _) = context(SimBoard::beaglebone_black(ServoPolarity::Inverted));
        digital_pin_mode(&mut ctx, &pin_mode("p9_14", "PWM")).unwrap();
        let write = |v: &str| Fields::new(Command::AnalogWrite).with("pin", "P9_14").with("value", v);
        assert_eq!(analog_write(&mut ctx, &write("150")), Err(ANALOG_WRITE_OUT_OF_RANGE));
        analog_write(&mut ctx, &write("12.5")).unwrap();
        assert_eq!(handle.writes(), vec![(PinId::from("P9_14"), PinOutput::Pwm(12.5))]);
    }

    #[test]
    fn servo_position_is_mapped_per_platform() {
        let (mut ctx, handle, _) = context(SimBoard::raspberry_pi());
        digital_pin_mode(&mut ctx, &pin_mode("18", "Servo")).unwrap();
        let servo = |p: &str| Fields::new(Command::SetServoPosition).with("pin", "18").with("position", p);
        assert_eq!(set_servo_position(&mut ctx, &servo("200")), Err(SERVO_OUT_OF_RANGE));
        assert_eq!(set_servo_position(&mut ctx, &servo("-5")), Err(SERVO_OUT_OF_RANGE));
        assert_eq!(set_servo_position(&mut ctx, &servo("left")), Err(SERVO_INVALID_POSITION));
        assert!(handle.writes().is_empty());
        set_servo_position(&mut ctx, &servo("90")).unwrap();
        assert_eq!(
            handle.writes(),
            vec![(PinId::Index(18), PinOutput::Servo(ServoOutput::PulseWidthUs(1500)))]
        );
    }

    #[test]
    fn tone_requires_tone_mode() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        let tone = Fields::new(Command::PlayTone)
            .with("pin", "8")
            .with("frequency", "440")
            .with("duration", "250");
        assert_eq!(play_tone(&mut ctx, &tone), Err(TONE_WRONG_MODE));
        digital_pin_mode(&mut ctx, &pin_mode("8", "Tone")).unwrap();
        play_tone(&mut ctx, &tone).unwrap();
        let bad = tone.clone().with("frequency", "0");
        assert_eq!(play_tone(&mut ctx, &bad), Err(TONE_INVALID_FREQUENCY));
        let bad = tone.clone().with("duration", "soon");
        assert_eq!(play_tone(&mut ctx, &bad), Err(TONE_INVALID_DURATION));
        tone_off(&mut ctx, &Fields::new(Command::ToneOff).with("pin", "8")).unwrap();
        assert_eq!(
            handle.writes(),
            vec![
                (
                    PinId::Index(8),
                    PinOutput::Tone {
                        frequency: 440,
                        duration_ms: 250
                    }
                ),
                (PinId::Index(8), PinOutput::ToneOff),
            ]
        );
    }

    #[test]
    fn input_enable_reports_current_value() {
        let (mut ctx, handle, sink) = context(SimBoard::arduino_uno());
        handle.inject_input(2u16, 1);
        digital_pin_mode(&mut ctx, &pin_mode("2", "Input")).unwrap();
        let reports = sink.0.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].command(), Some("digital_read"));
        assert_eq!(reports[0].int("value"), Some(1));
    }

    #[test]
    fn switching_away_from_input_stops_change_reports() {
        let (mut ctx, handle, sink) = context(SimBoard::arduino_uno());
        digital_pin_mode(&mut ctx, &pin_mode("2", "Input")).unwrap();
        digital_pin_mode(&mut ctx, &pin_mode("2", "Output")).unwrap();
        handle.inject_input(2u16, 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn analog_pin_mode_validates_the_analog_bank() {
        let (mut ctx, _, _) = context(SimBoard::arduino_uno());
        let mode = |pin: &str, enable: &str| {
            Fields::new(Command::AnalogPinMode).with("pin", pin).with("enable", enable)
        };
        assert_eq!(analog_pin_mode(&mut ctx, &mode("9", "Enable")), Err(ANALOG_MODE_INVALID_PIN));
        assert_eq!(analog_pin_mode(&mut ctx, &mode("2", "on")), Err(ANALOG_MODE_INVALID_ENABLE));
        assert_eq!(analog_pin_mode(&mut ctx, &mode("2", "Disable")), Ok(()));
        assert_eq!(analog_pin_mode(&mut ctx, &mode("2", "Enable")), Ok(()));
        let state = ctx.pins().get(Bank::Analog, &PinId::Index(2)).unwrap();
        assert_eq!((state.mode, state.enabled), (PinMode::Analog, true));
        ctx.cleanup();
    }

    #[test]
    fn i2c_requires_init_and_a_bus() {
        let (mut ctx, _, _) = context(SimBoard::raspberry_pi());
        let init = Fields::new(Command::I2cRequest).with("cmd", "init").with("device_address", 83i64);
        assert_eq!(i2c_request(&mut ctx, &init), Err(I2C_UNSUPPORTED));

        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        handle.attach_i2c_device(83, &[]);
        let write = Fields::new(Command::I2cRequest)
            .with("cmd", "write_byte")
            .with("device_address", "83")
            .with("register", "45")
            .with("value", "8");
        assert_eq!(i2c_request(&mut ctx, &write), Err(I2C_NOT_INITIALIZED));
        i2c_request(&mut ctx, &init).unwrap();
        i2c_request(&mut ctx, &write).unwrap();
        assert_eq!(handle.i2c_register(83, 45), Some(8));

        let bad = write.clone().with("value", "300");
        assert_eq!(i2c_request(&mut ctx, &bad), Err(I2C_INVALID_ARGUMENT));
        let bad = init.clone().with("device_address", "200");
        assert_eq!(i2c_request(&mut ctx, &bad), Err(I2C_INVALID_ADDRESS));
        let bad = init.clone().with("cmd", "reset");
        assert_eq!(i2c_request(&mut ctx, &bad), Err(I2C_UNKNOWN_CMD));
    }

    #[test]
    fn read_block_leaves_a_read_in_flight() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        handle.attach_i2c_device(83, &[(50, 7)]);
        handle.set_i2c_latency(0);
        let init = Fields::new(Command::I2cRequest).with("cmd", "init").with("device_address", 83i64);
        i2c_request(&mut ctx, &init).unwrap();
        assert!(!ctx.i2c_pending());

        let read = Fields::new(Command::I2cRequest)
            .with("cmd", "read_block")
            .with("device_address", 83i64)
            .with("register", 50i64)
            .with("num_bytes", 2i64);
        i2c_request(&mut ctx, &read).unwrap();
        assert!(ctx.i2c_pending());
        assert_eq!(ctx.poll_i2c_reply(), Some(vec![7, 0]));
        assert!(!ctx.i2c_pending());
        assert_eq!(ctx.poll_i2c_reply(), None);
    }

    #[test]
    fn driver_failure_is_not_a_problem() {
        let (mut ctx, handle, _) = context(SimBoard::arduino_uno());
        digital_pin_mode(&mut ctx, &pin_mode("13", "Output")).unwrap();
        handle.fail_writes(true);
        let write = Fields::new(Command::DigitalWrite).with("pin", "13").with("value", "1");
        assert_eq!(digital_write(&mut ctx, &write), Ok(()));
    }
}
