//! `backplane-middleware` – The Wire
//!
//! Moves topic-addressed envelopes between processes without caring about
//! their meaning (the codec is the one place that looks inside a payload).
//!
//! # Modules
//!
//! - [`codec`] – `Fields` ⇄ msgpack map payloads.
//! - [`frame`] – one envelope per WebSocket binary message.
//! - [`bus`] – in-process publisher / prefix subscriber / exclusive pair.
//! - [`transport`] – the same endpoints bound to or connected over TCP.
//! - [`router`] – the central broker in forwarder or direct-pair mode.
//! - [`shutdown`] – `watch`-based cooperative cancellation.

pub mod bus;
pub mod codec;
pub mod frame;
pub mod router;
pub mod shutdown;
pub mod transport;

pub use bus::{MessageBus, Pair, PairSender, Publisher, Subscriber};
pub use router::{DirectPairRelay, Router, RouterConfig, RouterMode};
pub use transport::Transport;
