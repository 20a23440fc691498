//! The generic bridge loop shared by every hardware adapter.
//!
//! ```text
//! Discovering ──► Idle ──► Processing ──► Idle
//!                  │            │
//!                  │            └──► AwaitingI2cReply ──► Idle
//!                  └──► ShuttingDown
//! ```
//!
//! Each [`Bridge::step`] flushes at most one pending problem, then does one
//! unit of receive work: a single non-blocking receive, or a single poll for
//! the in-flight i2c reply. [`Bridge::run`] sleeps one quantum whenever a
//! step found nothing to do.

use std::sync::Arc;
use std::time::Duration;

use backplane_hal::{PinDriver, PinTable, ReportSink};
use backplane_middleware::{Publisher, Subscriber, codec, shutdown};
use backplane_types::{BackplaneError, Command, FieldValue, Fields, Message, Topic};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::handlers::{self, BridgeContext};
use crate::problem::{ProblemSlot, codes};
use crate::registry::{CommandRegistry, Dispatch};

pub const DEFAULT_I2C_MAX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub board: u16,
    pub quantum: Duration,
    /// Reply polls before an i2c read is abandoned with problem `8-5`.
    pub i2c_max_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            board: 1,
            quantum: Duration::from_millis(1),
            i2c_max_attempts: DEFAULT_I2C_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Discovering,
    Idle,
    Processing,
    AwaitingI2cReply { attempts: u32 },
    ShuttingDown,
}

/// Whether a [`Bridge::step`] did any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Busy,
    Idle,
}

// ────────────────────────────────────────────────────────────────────────────
// Report publishing
// ────────────────────────────────────────────────────────────────────────────

/// Publishes report fields under one board's `B<n>` topic. Shared between
/// the bridge loop and driver callbacks.
pub struct ReportPublisher {
    topic: Topic,
    publisher: Publisher,
}

impl ReportPublisher {
    pub fn new(board: u16, publisher: Publisher) -> Self {
        Self {
            topic: Topic::report(board),
            publisher,
        }
    }
}

impl ReportSink for ReportPublisher {
    fn report(&self, fields: Fields) {
        let message: Result<Message, _> = codec::encode(self.topic.clone(), &fields);
        match message {
            Ok(message) => {
                trace!(topic = %self.topic, command = fields.command(), "report");
                self.publisher.send(message);
            }
            Err(e) => warn!(topic = %self.topic, error = %e, "report could not be encoded"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge
// ────────────────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    state: BridgeState,
    context: BridgeContext,
    registry: CommandRegistry<BridgeContext>,
    subscriber: Subscriber,
    reports: Arc<ReportPublisher>,
    problem: ProblemSlot,
    command_topic: Topic,
}

impl Bridge {
    /// Probe the device, subscribe to `A<board>` and `Q`, and enter `Idle`.
    ///
    /// # Errors
    ///
    /// Whatever the driver's capability probe returns.
    pub fn start(
        config: BridgeConfig,
        driver: Box<dyn PinDriver>,
        mut subscriber: Subscriber,
        publisher: Publisher,
    ) -> Result<Self, BackplaneError> {
        let board = config.board;
        debug!(board, state = ?BridgeState::Discovering, "bridge starting");
        let reports = Arc::new(ReportPublisher::new(board, publisher));
        let context = BridgeContext::discover(board, driver, reports.clone())?;

        let command_topic = Topic::command(board);
        subscriber.subscribe(command_topic.clone());
        subscriber.subscribe(Topic::broadcast());

        let mut registry = CommandRegistry::new();
        handlers::register_all(&mut registry);

        info!(board, platform = %context.platform(), i2c = context.has_i2c(), "bridge ready");
        Ok(Self {
            config,
            state: BridgeState::Idle,
            context,
            registry,
            subscriber,
            reports,
            problem: ProblemSlot::default(),
            command_topic,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn board(&self) -> u16 {
        self.config.board
    }

    pub fn pins(&self) -> &PinTable {
        self.context.pins()
    }

    /// One loop iteration.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::Transport`] once the command subscription closes.
    pub fn step(&mut self) -> Result<Step, BackplaneError> {
        let mut busy = self.flush_problem();
        match self.state {
            BridgeState::ShuttingDown => return Ok(Step::Idle),
            BridgeState::AwaitingI2cReply { attempts } => busy |= self.poll_i2c(attempts),
            BridgeState::Discovering | BridgeState::Idle | BridgeState::Processing => {
                if let Some(message) = self.subscriber.try_recv()? {
                    self.process(&message);
                    busy = true;
                }
            }
        }
        Ok(if busy { Step::Busy } else { Step::Idle })
    }

    /// Step until shutdown is requested or the subscription closes, then
    /// release the device.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BackplaneError> {
        let result = loop {
            if shutdown::requested(&shutdown) {
                break Ok(());
            }
            match self.step() {
                Ok(Step::Busy) => tokio::task::yield_now().await,
                Ok(Step::Idle) => {
                    if shutdown::idle(self.config.quantum, &mut shutdown).await {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// Enter `ShuttingDown` and release the device. Runs once.
    pub fn shutdown(&mut self) {
        if self.state == BridgeState::ShuttingDown {
            return;
        }
        self.state = BridgeState::ShuttingDown;
        self.context.cleanup();
        info!(board = self.config.board, "bridge shut down");
    }

    fn publish(&self, fields: Fields) {
        self.reports.report(fields);
    }

    fn flush_problem(&mut self) -> bool {
        let Some(report) = self.problem.take() else {
            return false;
        };
        self.publish(
            Fields::new(Command::Problem)
                .with("board", self.config.board)
                .with("problem", report.code.wire()),
        );
        true
    }

    fn poll_i2c(&mut self, attempts: u32) -> bool {
        if let Some(data) = self.context.poll_i2c_reply() {
            self.publish(
                Fields::new(Command::I2cReply)
                    .with("board", self.config.board)
                    .with("data", FieldValue::Bytes(data)),
            );
            self.state = BridgeState::Idle;
            return true;
        }
        let attempts = attempts + 1;
        if attempts >= self.config.i2c_max_attempts {
            let address = self.context.abandon_i2c();
            info!(board = self.config.board, ?address, attempts, code = %codes::I2C_TIMEOUT.code, "i2c reply timed out");
            self.problem.set(codes::I2C_TIMEOUT);
            self.state = BridgeState::Idle;
            return true;
        }
        self.state = BridgeState::AwaitingI2cReply { attempts };
        false
    }

    fn process(&mut self, message: &Message) {
        let broadcast = message.topic == Topic::broadcast();
        if message.topic != self.command_topic && !broadcast {
            trace!(board = self.config.board, topic = %message.topic, "not addressed to this board");
            return;
        }
        let fields = match codec::decode(message) {
            Ok((_, fields)) => fields,
            Err(e) => {
                warn!(board = self.config.board, topic = %message.topic, error = %e, "dropping message");
                return;
            }
        };
        if broadcast && (fields.command() != Some(Command::I2cRequest.as_str()) || !self.context.has_i2c()) {
            trace!(board = self.config.board, command = fields.command(), "broadcast ignored");
            return;
        }

        self.state = BridgeState::Processing;
        match self.registry.dispatch(&mut self.context, &fields) {
            Dispatch::Handled => {}
            Dispatch::Rejected(report) => {
                info!(
                    board = self.config.board,
                    command = fields.command(),
                    code = %report.code,
                    reason = report.reason,
                    "command rejected"
                );
                self.problem.set(report);
            }
            Dispatch::Unknown(name) => {
                debug!(board = self.config.board, command = %name, "unknown command dropped");
            }
        }
        self.state = if self.context.i2c_pending() {
            BridgeState::AwaitingI2cReply { attempts: 0 }
        } else {
            BridgeState::Idle
        };
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_hal::{Bank, PinId, PinOutput, ServoOutput, ServoPolarity, SimBoard, SimHandle, SimOp};
    use backplane_middleware::MessageBus;
    use backplane_types::PinMode;

    struct Rig {
        bridge: Bridge,
        commands: Publisher,
        reports: Subscriber,
        sim: SimHandle,
    }

    impl Rig {
        fn new(board: SimBoard, config: BridgeConfig) -> Self {
            let command_bus = MessageBus::default();
            let report_bus = MessageBus::default();
            let sim = board.handle();
            let mut reports = report_bus.subscriber();
            reports.subscribe(Topic::everything());
            let bridge = Bridge::start(
                config,
                Box::new(board),
                command_bus.subscriber(),
                report_bus.publisher(),
            )
            .unwrap();
            Self {
                bridge,
                commands: command_bus.publisher(),
                reports,
                sim,
            }
        }

        fn uno() -> Self {
            Self::new(SimBoard::arduino_uno(), BridgeConfig::default())
        }

        fn send(&self, topic: &str, fields: Fields) {
            self.commands.send(codec::encode(topic, &fields).unwrap());
        }

        /// Step until a step finds nothing to do.
        fn settle(&mut self) {
            for _ in 0..16 {
                if self.bridge.step().unwrap() == Step::Idle {
                    return;
                }
            }
            panic!("bridge never went idle");
        }

        fn drain(&mut self) -> Vec<(Topic, Fields)> {
            let mut out = Vec::new();
            while let Some(message) = self.reports.try_recv().unwrap() {
                out.push(codec::decode(&message).unwrap());
            }
            out
        }
    }

    fn pin_mode(pin: &str, mode: &str) -> Fields {
        Fields::new(Command::DigitalPinMode)
            .with("enable", "Enable")
            .with("pin", pin)
            .with("mode", mode)
    }

    fn write(pin: &str, value: &str) -> Fields {
        Fields::new(Command::DigitalWrite).with("pin", pin).with("value", value)
    }

    #[test]
    fn configure_write_and_reject_out_of_range_pin() {
        let mut rig = Rig::uno();
        assert_eq!(rig.bridge.state(), BridgeState::Idle);

        rig.send("A1", pin_mode("13", "Output"));
        rig.settle();
        assert!(rig.drain().is_empty());
        let state = rig.bridge.pins().get(Bank::Digital, &PinId::Index(13)).unwrap();
        assert_eq!((state.mode, state.enabled), (PinMode::Output, true));

        rig.send("A1", write("13", "1"));
        rig.settle();
        assert!(rig.drain().is_empty());
        assert_eq!(rig.sim.writes(), vec![(PinId::Index(13), PinOutput::Digital(true))]);

        rig.send("A1", write("99", "1"));
        rig.settle();
        let reports = rig.drain();
        assert_eq!(reports.len(), 1);
        let (topic, fields) = &reports[0];
        assert_eq!(topic, &Topic::from("B1"));
        assert_eq!(fields.command(), Some("problem"));
        assert_eq!(fields.int("board"), Some(1));
        assert_eq!(fields.text("problem"), Some("3-1\n"));
        assert_eq!(rig.sim.writes().len(), 1);
    }

    #[test]
    fn repeated_configuration_is_idempotent() {
        let mut rig = Rig::uno();
        rig.send("A1", pin_mode("13", "Output"));
        rig.settle();
        let once = rig.bridge.pins().clone();
        rig.send("A1", pin_mode("13", "Output"));
        rig.settle();
        assert_eq!(rig.bridge.pins(), &once);
        assert!(rig.drain().is_empty());
    }

    #[test]
    fn only_exact_board_topic_is_handled() {
        let mut rig = Rig::uno();
        rig.send("A10", pin_mode("13", "Output"));
        rig.send("A2", pin_mode("13", "Output"));
        rig.settle();
        assert!(rig.sim.ops().is_empty());
        let state = rig.bridge.pins().get(Bank::Digital, &PinId::Index(13)).unwrap();
        assert_eq!(state.mode, PinMode::Unset);
    }

    #[test]
    fn servo_scenario() {
        let mut rig = Rig::new(
            SimBoard::beaglebone_black(ServoPolarity::Inverted),
            BridgeConfig::default(),
        );
        rig.send("A1", pin_mode("P9_14", "Servo"));
        rig.send(
            "A1",
            Fields::new(Command::SetServoPosition)
                .with("pin", "P9_14")
                .with("position", "90"),
        );
        rig.settle();
        assert_eq!(
            rig.sim.writes(),
            vec![(PinId::from("P9_14"), PinOutput::Servo(ServoOutput::DutyCycle(91.25)))]
        );

        rig.send(
            "A1",
            Fields::new(Command::SetServoPosition)
                .with("pin", "P9_14")
                .with("position", "200"),
        );
        rig.settle();
        let reports = rig.drain();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.text("problem"), Some("7-5\n"));
        assert_eq!(rig.sim.writes().len(), 1);
    }

    #[test]
    fn input_changes_are_reported_on_board_topic() {
        let mut rig = Rig::uno();
        rig.send("A1", pin_mode("7", "Input"));
        rig.settle();
        rig.sim.inject_input(7u16, 1);

        let reports = rig.drain();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(topic, _)| topic == &Topic::report(1)));
        assert_eq!(reports[0].1.int("value"), Some(0));
        assert_eq!(reports[1].1.command(), Some("digital_read"));
        assert_eq!(reports[1].1.text("pin"), Some("7"));
        assert_eq!(reports[1].1.int("value"), Some(1));
    }

    #[test]
    fn malformed_and_unknown_messages_are_dropped() {
        let mut rig = Rig::uno();
        rig.commands.send(Message::new("A1", vec![0xc1]));
        rig.send("A1", Fields::new(Command::Tweet).with("message", "hi"));
        rig.send("A1", Fields::empty().with("pin", "13"));
        rig.send("A1", pin_mode("13", "Output"));
        rig.settle();
        assert!(rig.drain().is_empty());
        assert_eq!(rig.sim.ops().len(), 1);
    }

    fn i2c(cmd: &str) -> Fields {
        Fields::new(Command::I2cRequest)
            .with("cmd", cmd)
            .with("device_address", 83i64)
    }

    #[test]
    fn i2c_read_replies_on_board_topic() {
        let mut rig = Rig::uno();
        rig.sim.attach_i2c_device(83, &[(50, 1), (51, 2), (52, 3)]);
        rig.send("Q", i2c("init"));
        rig.send(
            "A1",
            i2c("read_block").with("register", 50i64).with("num_bytes", 3i64),
        );
        rig.bridge.step().unwrap();
        rig.bridge.step().unwrap();
        assert_eq!(rig.bridge.state(), BridgeState::AwaitingI2cReply { attempts: 0 });

        for _ in 0..10 {
            if rig.bridge.state() == BridgeState::Idle {
                break;
            }
            rig.bridge.step().unwrap();
        }
        assert_eq!(rig.bridge.state(), BridgeState::Idle);

        let reports = rig.drain();
        assert_eq!(reports.len(), 1);
        let (topic, fields) = &reports[0];
        assert_eq!(topic, &Topic::report(1));
        assert_eq!(fields.command(), Some("i2c_reply"));
        assert_eq!(fields.get("data"), Some(&FieldValue::Bytes(vec![1, 2, 3])));
    }

    #[test]
    fn i2c_reply_timeout_raises_problem() {
        let config = BridgeConfig {
            i2c_max_attempts: 3,
            ..BridgeConfig::default()
        };
        let mut rig = Rig::new(SimBoard::arduino_uno(), config);
        rig.sim.set_i2c_latency(u32::MAX);
        rig.send("A1", i2c("init"));
        rig.send("A1", i2c("read_block").with("register", 50i64).with("num_bytes", 6i64));
        for _ in 0..10 {
            rig.bridge.step().unwrap();
        }
        assert_eq!(rig.bridge.state(), BridgeState::Idle);
        let reports = rig.drain();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.text("problem"), Some("8-5\n"));
    }

    #[test]
    fn broadcast_is_ignored_without_i2c_bus() {
        let mut rig = Rig::new(SimBoard::raspberry_pi(), BridgeConfig::default());
        rig.send("Q", i2c("init"));
        rig.send("Q", pin_mode("4", "Output"));
        rig.settle();
        assert!(rig.drain().is_empty());
        assert!(rig.sim.ops().is_empty());
    }

    #[tokio::test]
    async fn run_cleans_up_on_shutdown() {
        let rig = Rig::uno();
        rig.send("A1", pin_mode("13", "Output"));
        let (trigger, rx) = shutdown::channel();
        let sim = rig.sim.clone();
        let task = tokio::spawn(rig.bridge.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        let ops = sim.ops();
        assert!(matches!(ops.first(), Some(SimOp::Enable { .. })));
        assert_eq!(ops.last(), Some(&SimOp::Cleanup));
        assert_eq!(ops.iter().filter(|op| **op == SimOp::Cleanup).count(), 1);
    }
}
