//! `backplane-runtime` – The Bridge
//!
//! The receive / validate / act / report loop every hardware adapter runs.
//!
//! # Modules
//!
//! - [`bridge`] – [`Bridge`][bridge::Bridge]: the state machine
//!   (`Discovering → Idle → Processing → Idle`, with a bounded
//!   `AwaitingI2cReply` sub-state) and the [`ReportPublisher`][bridge::ReportPublisher]
//!   that puts reports on the board's `B<n>` topic.
//! - [`registry`] – [`CommandRegistry`][registry::CommandRegistry]: command
//!   name to handler; unknown names are dropped without a report.
//! - [`handlers`] – the pin and i2c command handlers and the
//!   [`BridgeContext`][handlers::BridgeContext] they share.
//! - [`problem`] – problem codes and the single-slot pending problem.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console or
//!   JSON logs, plus OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is
//!   set.
//!
//! # Error policy
//!
//! Validation failures never leave the loop iteration that found them: they
//! become a problem report. Only a closed command subscription ends
//! [`Bridge::run`][bridge::Bridge::run] with an error.

pub mod bridge;
pub mod handlers;
pub mod problem;
pub mod registry;
pub mod telemetry;

pub use bridge::{Bridge, BridgeConfig, BridgeState, ReportPublisher, Step};
pub use handlers::BridgeContext;
pub use problem::ProblemSlot;
pub use registry::{CommandRegistry, Dispatch};
pub use telemetry::{TracerProviderGuard, init_tracing};
