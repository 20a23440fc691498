//! [`HttpBridge`] – the HTTP listener, the report drain and the router link.
//!
//! Listens on `0.0.0.0:50208` by default. Every connection carries one
//! request; the answer is written with `Connection: close`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use backplane_middleware::router::report_filters;
use backplane_middleware::{Pair, Subscriber, Transport, codec, transport};
use backplane_types::{BackplaneError, Message};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::poll::{self, PollBuffer};
use crate::routes::{self, CommandLink, Response};

/// Default TCP port for polling clients.
pub const DEFAULT_PORT: u16 = 50208;

/// Largest request head read before giving up.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the front-end reaches the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    /// Publish to the router's publish port, subscribe to its subscribe port.
    #[default]
    PubSub,
    /// One duplex link to a router in direct-pair mode.
    Pair,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkMode::PubSub => "pub-sub",
            LinkMode::Pair => "pair",
        })
    }
}

impl FromStr for LinkMode {
    type Err = BackplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pub-sub" | "pubsub" => Ok(LinkMode::PubSub),
            "pair" | "direct-pair" => Ok(LinkMode::Pair),
            other => Err(BackplaneError::Config(format!("unknown link mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    pub router_address: String,
    pub publish_port: u16,
    pub subscribe_port: u16,
    pub pair_port: u16,
    /// Reports from boards `1..=report_boards` reach the poll buffer.
    pub report_boards: u16,
    pub reconnect: Duration,
    pub link: LinkMode,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            router_address: "127.0.0.1".into(),
            publish_port: 43124,
            subscribe_port: 43125,
            pair_port: 43123,
            report_boards: backplane_types::MAX_BOARD,
            reconnect: Duration::from_millis(500),
            link: LinkMode::PubSub,
        }
    }
}

// ---------------------------------------------------------------------------
// Report drain
// ---------------------------------------------------------------------------

/// Inbound side of the router link.
pub enum ReportSource {
    Subscriber(Subscriber),
    Pair(Pair),
}

impl ReportSource {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            ReportSource::Subscriber(subscriber) => subscriber.recv().await,
            ReportSource::Pair(pair) => pair.recv().await,
        }
    }
}

/// Format every report from `source` into `buffer` until shutdown or until
/// the source closes. Undecodable and unknown-shape reports are dropped.
pub async fn drain_reports(
    mut source: ReportSource,
    buffer: PollBuffer,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            message = source.recv() => message,
            _ = backplane_middleware::shutdown::wait(&mut shutdown) => return,
        };
        let Some(message) = message else {
            warn!("report link closed");
            return;
        };
        match codec::decode(&message) {
            Ok((topic, fields)) => match poll::format_report(&topic, &fields) {
                Some(line) => buffer.append(&line),
                None => debug!(%topic, command = fields.command().unwrap_or_default(), "report not polled"),
            },
            Err(e) => debug!(topic = %message.topic, error = %e, "undecodable report dropped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// The bound HTTP listener.
pub struct HttpServer {
    listener: TcpListener,
    link: CommandLink,
    buffer: PollBuffer,
}

impl HttpServer {
    /// # Errors
    ///
    /// Returns [`BackplaneError::Bind`] if the TCP listener cannot bind.
    pub async fn bind(
        addr: &str,
        link: CommandLink,
        buffer: PollBuffer,
    ) -> Result<Self, BackplaneError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| BackplaneError::Bind {
            addr: addr.to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            listener,
            link,
            buffer,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until shutdown.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = backplane_middleware::shutdown::wait(&mut shutdown) => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let link = self.link.clone();
                    let buffer = self.buffer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &link, &buffer).await {
                            debug!(%peer, error = %e, "http client error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
        info!("http listener closed");
    }
}

/// Read the request head, answer it, close.
async fn handle_connection(
    mut stream: TcpStream,
    link: &CommandLink,
    buffer: &PollBuffer,
) -> Result<(), BackplaneError> {
    let head = read_head(&mut stream).await?;
    let response = match request_path(&head) {
        Some(("GET", path)) => routes::handle(path, link, buffer),
        Some((_, _)) => Response::text(405, "Method Not Allowed", "method not allowed"),
        None => Response::text(400, "Bad Request", "bad request"),
    };
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| BackplaneError::Transport(format!("HTTP write error: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| BackplaneError::Transport(format!("HTTP shutdown error: {e}")))
}

async fn read_head(stream: &mut TcpStream) -> Result<String, BackplaneError> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| BackplaneError::Transport(format!("HTTP read error: {e}")))?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// `(METHOD, path)` from the request line. The method is upper-cased.
fn request_path(head: &str) -> Option<(&'static str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let method = if method.eq_ignore_ascii_case("GET") {
        "GET"
    } else {
        "OTHER"
    };
    Some((method, path))
}

// ---------------------------------------------------------------------------
// HttpBridge
// ---------------------------------------------------------------------------

/// The complete front-end: router link, report drain and HTTP listener.
pub struct HttpBridge {
    config: HttpConfig,
}

impl HttpBridge {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    fn router_addr(&self, port: u16) -> String {
        format!("{}:{port}", self.config.router_address)
    }

    /// Link to the router, bind the listener and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`BackplaneError::Bind`] if the HTTP port cannot be bound.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BackplaneError> {
        let reconnect = self.config.reconnect;
        let mut transports: Vec<Transport> = Vec::new();

        let (link, source) = match self.config.link {
            LinkMode::PubSub => {
                let (publisher, pub_t) =
                    transport::connect_publisher(&self.router_addr(self.config.publish_port), reconnect);
                let (mut subscriber, sub_t) =
                    transport::connect_subscriber(&self.router_addr(self.config.subscribe_port), reconnect);
                for topic in report_filters(self.config.report_boards) {
                    subscriber.subscribe(topic);
                }
                transports.push(pub_t);
                transports.push(sub_t);
                (CommandLink::PubSub(publisher), ReportSource::Subscriber(subscriber))
            }
            LinkMode::Pair => {
                let (pair, pair_t) =
                    transport::connect_pair(&self.router_addr(self.config.pair_port), reconnect);
                transports.push(pair_t);
                (CommandLink::Pair(pair.sender()), ReportSource::Pair(pair))
            }
        };

        let buffer = PollBuffer::new();
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let server = HttpServer::bind(&addr, link, buffer.clone()).await?;
        info!(
            %addr,
            link = %self.config.link,
            router = %self.config.router_address,
            "http bridge listening"
        );

        let drain = tokio::spawn(drain_reports(source, buffer, shutdown.clone()));
        server.serve(shutdown).await;

        if let Err(e) = drain.await {
            warn!(error = %e, "report drain ended abnormally");
        }
        while let Some(transport) = transports.pop() {
            transport.shutdown();
        }
        info!("http bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_middleware::MessageBus;
    use backplane_middleware::shutdown;
    use backplane_types::{Command, Fields, Topic};
    use tokio::time::timeout;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn request_line_parsing() {
        assert_eq!(
            request_path("GET /poll HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some(("GET", "/poll"))
        );
        assert_eq!(request_path("Get /poll HTTP/1.1\r\n"), Some(("GET", "/poll")));
        assert_eq!(request_path("POST /poll HTTP/1.1\r\n"), Some(("OTHER", "/poll")));
        assert_eq!(request_path(""), None);
    }

    #[test]
    fn link_mode_parsing() {
        assert_eq!("pubsub".parse::<LinkMode>().unwrap(), LinkMode::PubSub);
        assert_eq!("Pair".parse::<LinkMode>().unwrap(), LinkMode::Pair);
        assert!("carrier-pigeon".parse::<LinkMode>().is_err());
    }

    #[tokio::test]
    async fn drain_formats_reports_into_buffer() {
        let reports = MessageBus::default();
        let mut subscriber = reports.subscriber();
        subscriber.subscribe(Topic::report(1));
        let buffer = PollBuffer::new();
        let (trigger, rx) = shutdown::channel();
        let task = tokio::spawn(drain_reports(
            ReportSource::Subscriber(subscriber),
            buffer.clone(),
            rx,
        ));

        let publisher = reports.publisher();
        let read = Fields::new(Command::DigitalRead)
            .with("pin", 2i64)
            .with("value", 0i64);
        let reply = Fields::new(Command::I2cReply).with("data", vec![1u8]);
        publisher.send(codec::encode(Topic::report(1), &reply).unwrap());
        publisher.send(Message::new(Topic::report(1), vec![0xc1]));
        publisher.send(codec::encode(Topic::report(1), &read).unwrap());

        timeout(Duration::from_secs(2), async {
            while buffer.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(buffer.take(), "digital_read/1/2 0\n");

        trigger.trigger();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drain_reads_the_pair_link() {
        let (router_end, front_end) = Pair::inproc();
        let buffer = PollBuffer::new();
        let (_trigger, rx) = shutdown::channel();
        let task = tokio::spawn(drain_reports(ReportSource::Pair(front_end), buffer.clone(), rx));

        let problem = Fields::new(Command::Problem)
            .with("board", 2i64)
            .with("problem", "4-5\n");
        router_end
            .send(codec::encode(Topic::report(2), &problem).unwrap())
            .unwrap();
        drop(router_end);

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(buffer.take(), "problem/2 4-5\n");
    }

    #[tokio::test]
    async fn loopback_request_reaches_the_bus() {
        let bus = MessageBus::default();
        let mut commands = bus.subscriber();
        commands.subscribe(Topic::command(3));
        let buffer = PollBuffer::new();
        let server = HttpServer::bind(
            "127.0.0.1:0",
            CommandLink::PubSub(bus.publisher()),
            buffer.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (trigger, rx) = shutdown::channel();
        let serving = tokio::spawn(server.serve(rx));

        let response = get(addr, "/set_servo_position/3/9/45").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("\r\n\r\nok"));

        let message = commands.try_recv().unwrap().expect("command published");
        let (_, fields) = codec::decode(&message).unwrap();
        assert_eq!(fields.command(), Some("set_servo_position"));
        assert_eq!(fields.text("position"), Some("45"));

        buffer.append("analog_read/3/0 17\n");
        let poll = get(addr, "/poll").await;
        assert!(poll.contains("Access-Control-Allow-Origin: *"));
        assert!(poll.ends_with("analog_read/3/0 17\n"));
        assert!(get(addr, "/poll").await.ends_with("\r\n\r\n"));

        assert!(get(addr, "/nowhere").await.starts_with("HTTP/1.1 404"));

        trigger.trigger();
        timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
    }

    /// Serve `path`, then let the bridge and the drain catch up.
    async fn exchange(
        path: &str,
        link: &CommandLink,
        buffer: &PollBuffer,
        bridge: &mut backplane_runtime::Bridge,
    ) -> Response {
        let response = routes::handle(path, link, buffer);
        for _ in 0..4 {
            bridge.step().unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        response
    }

    /// Front-end and bridge on in-process buses: a good configuration and
    /// write are silent, an out-of-range pin shows up on the next poll.
    #[tokio::test]
    async fn poll_reports_problem_from_bridge() {
        use backplane_hal::SimBoard;
        use backplane_runtime::{Bridge, BridgeConfig};

        let commands = MessageBus::default();
        let reports = MessageBus::default();
        let mut bridge = Bridge::start(
            BridgeConfig::default(),
            Box::new(SimBoard::arduino_uno()),
            commands.subscriber(),
            reports.publisher(),
        )
        .unwrap();

        let mut report_subscriber = reports.subscriber();
        for topic in report_filters(10) {
            report_subscriber.subscribe(topic);
        }
        let buffer = PollBuffer::new();
        let (_trigger, rx) = shutdown::channel();
        tokio::spawn(drain_reports(
            ReportSource::Subscriber(report_subscriber),
            buffer.clone(),
            rx,
        ));
        let link = CommandLink::PubSub(commands.publisher());

        assert_eq!(exchange("/digital_pin_mode/1/Enable/13/Output", &link, &buffer, &mut bridge).await.body, b"ok");
        assert_eq!(exchange("/digital_write/1/13/1", &link, &buffer, &mut bridge).await.body, b"ok");
        assert!(routes::handle("/poll", &link, &buffer).body.is_empty());

        assert_eq!(exchange("/digital_write/1/99/1", &link, &buffer, &mut bridge).await.body, b"ok");
        timeout(Duration::from_secs(2), async {
            while buffer.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(routes::handle("/poll", &link, &buffer).body, b"problem/1 3-1\n");
    }

    #[tokio::test]
    async fn bind_failure_is_a_bind_error() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap().to_string();
        let result = HttpServer::bind(&addr, CommandLink::PubSub(MessageBus::default().publisher()), PollBuffer::new()).await;
        assert!(matches!(result, Err(BackplaneError::Bind { .. })));
    }
}
