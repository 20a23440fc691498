//! Network endpoints over WebSocket binary frames.
//!
//! Every endpoint either **binds** (accepting any number of peers, or one
//! for a pair) or **connects** (retrying at a fixed interval until the peer
//! appears, and again after it disappears). Each envelope is one binary
//! message laid out by [`crate::frame`].
//!
//! | Constructor | Peer traffic |
//! |---|---|
//! | [`bind_publisher`] / [`connect_publisher`] | outbound only |
//! | [`bind_subscriber`] / [`connect_subscriber`] | inbound only |
//! | [`bind_pair`] / [`connect_pair`] | both ways, one peer at a time |
//!
//! The returned [`Transport`] owns the background tasks; dropping it closes
//! every socket it opened.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backplane_types::{BackplaneError, Message};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, Pair, Publisher, Subscriber};
use crate::frame;

/// Owner of an endpoint's background tasks.
#[derive(Debug, Default)]
pub struct Transport {
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Transport {
    /// Address actually bound (useful when binding port 0). `None` for
    /// connecting endpoints.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close every socket this endpoint opened.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public constructors
// ────────────────────────────────────────────────────────────────────────────

/// Bind a publisher: every message sent is forwarded to all connected peers.
pub async fn bind_publisher(addr: &str) -> Result<(Publisher, Transport), BackplaneError> {
    let bus = MessageBus::default();
    let transport = bind_egress(addr, &bus).await?;
    Ok((bus.publisher(), transport))
}

/// Bind a subscriber: messages from every connected peer are merged.
pub async fn bind_subscriber(addr: &str) -> Result<(Subscriber, Transport), BackplaneError> {
    let bus = MessageBus::default();
    let subscriber = bus.subscriber();
    let transport = bind_ingress(addr, &bus).await?;
    Ok((subscriber, transport))
}

/// Bind a listener whose peers' messages are all published onto `hub`.
pub async fn bind_ingress(addr: &str, hub: &MessageBus) -> Result<Transport, BackplaneError> {
    let listener = listen(addr).await?;
    let local_addr = listener.local_addr().ok();
    let hub = hub.clone();

    let task = tokio::spawn(accept_loop(listener, move |stream| {
        let inbound = Inbound::Broadcast(hub.sender());
        Some(async move {
            let Some(ws) = handshake(stream).await else { return };
            info!("peer connected");
            let result = pump(ws, Outbound::Nothing, &inbound).await;
            log_disconnect(result);
        })
    }));

    Ok(Transport {
        tasks: vec![task],
        local_addr,
    })
}

/// Bind a listener that forwards everything published on `hub` to each of
/// its peers.
pub async fn bind_egress(addr: &str, hub: &MessageBus) -> Result<Transport, BackplaneError> {
    let listener = listen(addr).await?;
    let local_addr = listener.local_addr().ok();
    let hub = hub.clone();

    let task = tokio::spawn(accept_loop(listener, move |stream| {
        let mut receiver = hub.raw_receiver();
        Some(async move {
            let Some(ws) = handshake(stream).await else { return };
            info!("peer connected");
            let result = pump(ws, Outbound::Broadcast(&mut receiver), &Inbound::Discard).await;
            log_disconnect(result);
        })
    }));

    Ok(Transport {
        tasks: vec![task],
        local_addr,
    })
}

/// Bind one end of an exclusive pair. A second peer is refused while the
/// first is connected; messages sent before any peer arrives are queued.
pub async fn bind_pair(addr: &str) -> Result<(Pair, Transport), BackplaneError> {
    let listener = listen(addr).await?;
    let local_addr = listener.local_addr().ok();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let outgoing = Arc::new(Mutex::new(out_rx));

    let task = tokio::spawn(accept_loop(listener, move |stream| {
        let Ok(mut queue) = Arc::clone(&outgoing).try_lock_owned() else {
            warn!("pair already has a peer; refusing connection");
            return None;
        };
        let inbound = Inbound::Queue(in_tx.clone());
        Some(async move {
            let Some(ws) = handshake(stream).await else { return };
            info!("pair peer connected");
            let result = pump(ws, Outbound::Queue(&mut *queue), &inbound).await;
            log_disconnect(result);
        })
    }));

    Ok((
        Pair::from_channels(out_tx, in_rx),
        Transport {
            tasks: vec![task],
            local_addr,
        },
    ))
}

/// Connect a publisher to a bound subscriber at `addr`.
///
/// Messages sent while the link is down are buffered (up to the bus
/// capacity) and flushed once connected.
pub fn connect_publisher(addr: &str, reconnect: Duration) -> (Publisher, Transport) {
    let bus = MessageBus::default();
    let mut receiver = bus.raw_receiver();
    let url = ws_url(addr);

    let task = tokio::spawn(
        async move {
            loop {
                if let Some(ws) = dial(&url, reconnect).await {
                    let result = pump(ws, Outbound::Broadcast(&mut receiver), &Inbound::Discard).await;
                    log_disconnect(result);
                }
            }
        }
        .instrument(info_span!("connect", %addr, role = "publisher")),
    );

    (
        bus.publisher(),
        Transport {
            tasks: vec![task],
            local_addr: None,
        },
    )
}

/// Connect a subscriber to a bound publisher at `addr`. Messages published
/// while the link is down are never seen.
pub fn connect_subscriber(addr: &str, reconnect: Duration) -> (Subscriber, Transport) {
    let (sender, receiver) = broadcast::channel(crate::bus::DEFAULT_CAPACITY);
    let url = ws_url(addr);
    let inbound = Inbound::Broadcast(sender);

    let task = tokio::spawn(
        async move {
            loop {
                if let Some(ws) = dial(&url, reconnect).await {
                    let result = pump(ws, Outbound::Nothing, &inbound).await;
                    log_disconnect(result);
                }
            }
        }
        .instrument(info_span!("connect", %addr, role = "subscriber")),
    );

    (
        Subscriber::from_receiver(receiver),
        Transport {
            tasks: vec![task],
            local_addr: None,
        },
    )
}

/// Connect one end of a pair to a bound pair at `addr`.
pub fn connect_pair(addr: &str, reconnect: Duration) -> (Pair, Transport) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let url = ws_url(addr);
    let inbound = Inbound::Queue(in_tx);

    let task = tokio::spawn(
        async move {
            loop {
                if let Some(ws) = dial(&url, reconnect).await {
                    let result = pump(ws, Outbound::Queue(&mut out_rx), &inbound).await;
                    log_disconnect(result);
                }
            }
        }
        .instrument(info_span!("connect", %addr, role = "pair")),
    );

    (
        Pair::from_channels(out_tx, in_rx),
        Transport {
            tasks: vec![task],
            local_addr: None,
        },
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Internals
// ────────────────────────────────────────────────────────────────────────────

enum Outbound<'a> {
    Nothing,
    Broadcast(&'a mut broadcast::Receiver<Message>),
    Queue(&'a mut mpsc::UnboundedReceiver<Message>),
}

impl Outbound<'_> {
    async fn next(&mut self) -> Option<Message> {
        match self {
            Outbound::Nothing => std::future::pending().await,
            Outbound::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(message) => return Some(message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "peer link lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Outbound::Queue(rx) => rx.recv().await,
        }
    }
}

enum Inbound {
    Discard,
    Broadcast(broadcast::Sender<Message>),
    Queue(mpsc::UnboundedSender<Message>),
}

impl Inbound {
    /// Returns `false` once the local side has gone away.
    fn deliver(&self, message: Message) -> bool {
        match self {
            Inbound::Discard => true,
            Inbound::Broadcast(tx) => {
                let _ = tx.send(message);
                true
            }
            Inbound::Queue(tx) => tx.send(message).is_ok(),
        }
    }
}

async fn listen(addr: &str) -> Result<TcpListener, BackplaneError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| BackplaneError::Bind {
            addr: addr.to_string(),
            details: e.to_string(),
        })
}

/// Accept peers forever. Each peer session runs in a task owned by this
/// loop, so aborting the loop closes every connection it accepted.
/// `on_peer` runs inside the peer's span and returns `None` to refuse it.
async fn accept_loop<F, S>(listener: TcpListener, mut on_peer: F)
where
    F: FnMut(TcpStream) -> Option<S>,
    S: Future<Output = ()> + Send + 'static,
{
    let mut peers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let span = peer_span(peer);
                    if let Some(session) = span.in_scope(|| on_peer(stream)) {
                        peers.spawn(session.instrument(span));
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = peers.join_next(), if !peers.is_empty() => {}
        }
    }
}

async fn handshake(stream: TcpStream) -> Option<WebSocketStream<TcpStream>> {
    match accept_async(stream).await {
        Ok(ws) => Some(ws),
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            None
        }
    }
}

/// One connection attempt; sleeps `retry` after a failure.
async fn dial(
    url: &str,
    retry: Duration,
) -> Option<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    match connect_async(url).await {
        Ok((ws, _)) => {
            info!(url, "connected");
            Some(ws)
        }
        Err(e) => {
            debug!(url, error = %e, "connect failed; retrying");
            tokio::time::sleep(retry).await;
            None
        }
    }
}

/// Move frames between one websocket and the local endpoint until either
/// side closes.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: Outbound<'_>,
    inbound: &Inbound,
) -> Result<(), BackplaneError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            next = outbound.next() => {
                let Some(message) = next else { break };
                let bytes = frame::encode(&message)?;
                tx.send(WsMessage::Binary(bytes.into()))
                    .await
                    .map_err(|e| BackplaneError::Transport(e.to_string()))?;
            }
            incoming = rx.next() => match incoming {
                Some(Ok(WsMessage::Binary(bytes))) => match frame::decode(&bytes) {
                    Ok(message) => {
                        if !inbound.deliver(message) {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BackplaneError::Transport(e.to_string())),
            }
        }
    }
    let _ = tx.close().await;
    Ok(())
}

fn ws_url(addr: &str) -> String {
    format!("ws://{addr}/")
}

fn peer_span(peer: SocketAddr) -> tracing::Span {
    info_span!("peer", id = %Uuid::new_v4(), %peer)
}

fn log_disconnect(result: Result<(), BackplaneError>) {
    match result {
        Ok(()) => info!("peer disconnected"),
        Err(e) => warn!(error = %e, "peer link failed"),
    }
}
