//! In-process endpoints: topic-prefix publish/subscribe and exclusive pairs.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber sees every published message without any single subscriber
//! blocking the others. Filtering happens on the subscriber side.
//!
//! # Endpoints
//!
//! | Endpoint | Semantics |
//! |---|---|
//! | [`Publisher`] | Fire-and-forget fan-out; never blocks, never fails. |
//! | [`Subscriber`] | Receives messages whose topic starts with one of its prefixes. |
//! | [`Pair`] | Exclusive duplex link between exactly two parties, FIFO each way. |
//!
//! A subscriber that does not exist yet when a message is published never
//! sees it. Nothing here buffers on behalf of absent receivers.

use backplane_types::{BackplaneError, Message, Topic};
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

/// Default channel capacity (number of buffered messages before the oldest
/// are dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 1024;

/// Shared broadcast medium. Clone it cheaply; all clones share one channel.
#[derive(Clone, Debug)]
pub struct MessageBus {
    sender: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            sender: self.sender.clone(),
        }
    }

    /// A subscriber with no prefixes. It receives nothing until
    /// [`Subscriber::subscribe`] is called.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            prefixes: Vec::new(),
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<Message> {
        self.sender.clone()
    }

    pub(crate) fn raw_receiver(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Publisher {
    sender: broadcast::Sender<Message>,
}

impl Publisher {
    /// Publish `message`. Returns the number of receivers it reached; zero
    /// is a normal condition, not an error.
    pub fn send(&self, message: Message) -> usize {
        let topic = message.topic.clone();
        match self.sender.send(message) {
            Ok(n) => n,
            Err(_) => {
                trace!(%topic, "published with no receivers");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Prefix-filtering receiver.
///
/// An empty prefix matches every topic; a subscriber without any prefix
/// matches none.
pub struct Subscriber {
    prefixes: Vec<Topic>,
    receiver: broadcast::Receiver<Message>,
}

impl Subscriber {
    pub(crate) fn from_receiver(receiver: broadcast::Receiver<Message>) -> Self {
        Self {
            prefixes: Vec::new(),
            receiver,
        }
    }

    pub fn subscribe(&mut self, prefix: impl Into<Topic>) {
        let prefix = prefix.into();
        if !self.prefixes.contains(&prefix) {
            self.prefixes.push(prefix);
        }
    }

    pub fn unsubscribe(&mut self, prefix: &Topic) {
        self.prefixes.retain(|p| p != prefix);
    }

    pub fn prefixes(&self) -> &[Topic] {
        &self.prefixes
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        self.prefixes.iter().any(|p| topic.starts_with(p))
    }

    /// Non-blocking receive of the next matching message.
    ///
    /// Returns `Ok(None)` when nothing is ready ("would block").
    ///
    /// # Errors
    ///
    /// [`BackplaneError::Transport`] once the underlying channel has closed.
    pub fn try_recv(&mut self) -> Result<Option<Message>, BackplaneError> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if self.matches(&message.topic) => return Ok(Some(message)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "subscriber lagged; messages dropped");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(BackplaneError::Transport("subscriber channel closed".into()));
                }
            }
        }
    }

    /// Wait for the next matching message. `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.matches(&message.topic) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "subscriber lagged; messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pair
// ---------------------------------------------------------------------------

/// One side of an exclusive duplex link.
pub struct Pair {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

/// Cloneable sending half of a [`Pair`].
#[derive(Clone, Debug)]
pub struct PairSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl PairSender {
    pub fn send(&self, message: Message) -> Result<(), BackplaneError> {
        self.tx
            .send(message)
            .map_err(|_| BackplaneError::Transport("pair link closed".into()))
    }
}

impl Pair {
    /// Two connected in-process ends.
    pub fn inproc() -> (Pair, Pair) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Pair { tx: a_tx, rx: a_rx }, Pair { tx: b_tx, rx: b_rx })
    }

    pub(crate) fn from_channels(
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self { tx, rx }
    }

    pub fn send(&self, message: Message) -> Result<(), BackplaneError> {
        self.tx
            .send(message)
            .map_err(|_| BackplaneError::Transport("pair link closed".into()))
    }

    pub fn sender(&self) -> PairSender {
        PairSender {
            tx: self.tx.clone(),
        }
    }

    /// Non-blocking receive; `Ok(None)` when nothing is ready.
    pub fn try_recv(&mut self) -> Result<Option<Message>, BackplaneError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BackplaneError::Transport("pair link closed".into()))
            }
        }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
