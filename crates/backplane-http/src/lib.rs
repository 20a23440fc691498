//! `backplane-http` – The Polling Front-End
//!
//! Translates path-style GET requests from a polling client into command
//! envelopes for the router, and collects the asynchronous reports that come
//! back until the client next asks for them.
//!
//! 1. **Commands** (`/digital_write/{board}/{pin}/{value}` and friends) are
//!    published at once on `A{board}`; the client gets `ok` without waiting
//!    for the bridge.
//!
//! 2. **Reports** on `B1..B10` are formatted as `command/board/pin value`
//!    or `problem/board code` lines and appended to the [`PollBuffer`].
//!
//! 3. **`/poll`** swaps the buffer out and returns it as ISO-8859-1
//!    `text/html` with `Access-Control-Allow-Origin: *`.
//!
//! # Modules
//!
//! - [`poll`] – the shared buffer and report-line format.
//! - [`routes`] – the endpoint table and HTTP responses.
//! - [`server`] – listener, report drain and router link.
//!
//! # Usage
//!
//! ```rust,no_run
//! use backplane_http::{HttpBridge, HttpConfig};
//! use backplane_middleware::shutdown;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let (_trigger, rx) = shutdown::channel();
//!     HttpBridge::new(HttpConfig::default())
//!         .run(rx)
//!         .await
//!         .expect("http bridge failed");
//! }
//! ```

pub mod poll;
pub mod routes;
pub mod server;

pub use poll::{PollBuffer, format_report};
pub use routes::{CommandLink, Response, Route};
pub use server::{DEFAULT_PORT, HttpBridge, HttpConfig, HttpServer, LinkMode, ReportSource, drain_reports};
