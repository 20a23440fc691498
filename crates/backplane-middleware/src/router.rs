//! Central broker.
//!
//! | Mode | Sockets | Per-message logic |
//! |---|---|---|
//! | [`RouterMode::Forwarder`] | bound ingress on the publish port, bound egress on the subscribe port, joined by one hub | none |
//! | [`RouterMode::DirectPair`] | bound pair, bound publisher (commands out), bound subscriber (reports in, `B1..Bn`) | which side a message moves to |
//!
//! Payloads are never decoded here; a malformed message is relayed exactly
//! like a well-formed one.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backplane_types::{BackplaneError, Topic};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::bus::{MessageBus, Pair, Publisher, Subscriber};
use crate::{shutdown, transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMode {
    #[default]
    Forwarder,
    DirectPair,
}

impl fmt::Display for RouterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouterMode::Forwarder => "forwarder",
            RouterMode::DirectPair => "direct-pair",
        })
    }
}

impl FromStr for RouterMode {
    type Err = BackplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forwarder" => Ok(RouterMode::Forwarder),
            "direct-pair" | "pair" => Ok(RouterMode::DirectPair),
            other => Err(BackplaneError::Config(format!("unknown router mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind_address: String,
    /// Peers publish here (commands from front-ends, reports from bridges).
    pub publish_port: u16,
    /// Peers subscribe here.
    pub subscribe_port: u16,
    pub pair_port: u16,
    /// Direct-pair mode relays reports from boards `1..=report_boards`.
    pub report_boards: u16,
    pub quantum: Duration,
    pub mode: RouterMode,
}

/// Report topics `B1..B{boards}` forwarded by the direct-pair relay.
pub fn report_filters(boards: u16) -> Vec<Topic> {
    (1..=boards).map(Topic::report).collect()
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    fn addr(&self, port: u16) -> String {
        format!("{}:{port}", self.config.bind_address)
    }

    /// Bind every socket for the configured mode and relay until shutdown.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::Bind`] if any socket cannot be bound; there is no
    /// retry.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BackplaneError> {
        match self.config.mode {
            RouterMode::Forwarder => {
                let hub = MessageBus::default();
                let ingress = transport::bind_ingress(&self.addr(self.config.publish_port), &hub).await?;
                let egress = transport::bind_egress(&self.addr(self.config.subscribe_port), &hub).await?;
                info!(
                    mode = %self.config.mode,
                    publish_port = self.config.publish_port,
                    subscribe_port = self.config.subscribe_port,
                    "router forwarding"
                );

                shutdown::wait(&mut shutdown).await;

                egress.shutdown();
                ingress.shutdown();
            }
            RouterMode::DirectPair => {
                let (pair, pair_t) = transport::bind_pair(&self.addr(self.config.pair_port)).await?;
                let (publisher, pub_t) =
                    transport::bind_publisher(&self.addr(self.config.subscribe_port)).await?;
                let (mut subscriber, sub_t) =
                    transport::bind_subscriber(&self.addr(self.config.publish_port)).await?;
                for topic in report_filters(self.config.report_boards) {
                    subscriber.subscribe(topic);
                }
                info!(
                    mode = %self.config.mode,
                    pair_port = self.config.pair_port,
                    publish_port = self.config.publish_port,
                    subscribe_port = self.config.subscribe_port,
                    report_boards = self.config.report_boards,
                    "router relaying"
                );

                let relay = DirectPairRelay::new(pair, publisher, subscriber);
                let result = relay.run(self.config.quantum, &mut shutdown).await;

                sub_t.shutdown();
                pub_t.shutdown();
                pair_t.shutdown();
                result?;
            }
        }
        info!("router stopped");
        Ok(())
    }
}

/// The direct-pair loop body, separated from the sockets so it can run
/// against in-process endpoints.
pub struct DirectPairRelay {
    pair: Pair,
    publisher: Publisher,
    subscriber: Subscriber,
}

impl DirectPairRelay {
    pub fn new(pair: Pair, publisher: Publisher, subscriber: Subscriber) -> Self {
        Self {
            pair,
            publisher,
            subscriber,
        }
    }

    /// Move at most one message from the pair to the publisher and at most
    /// one from the subscriber back to the pair. Returns how many moved.
    pub fn relay_once(&mut self) -> Result<usize, BackplaneError> {
        let mut moved = 0;
        if let Some(command) = self.pair.try_recv()? {
            self.publisher.send(command);
            moved += 1;
        }
        if let Some(report) = self.subscriber.try_recv()? {
            self.pair.send(report)?;
            moved += 1;
        }
        Ok(moved)
    }

    pub async fn run(
        mut self,
        quantum: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BackplaneError> {
        loop {
            if shutdown::requested(shutdown) {
                return Ok(());
            }
            if self.relay_once()? == 0 && shutdown::idle(quantum, shutdown).await {
                return Ok(());
            }
        }
    }
}
