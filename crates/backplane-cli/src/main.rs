//! `backplane-cli` – Backplane Command Line Interface
//!
//! One binary, one role per invocation:
//!
//! | Subcommand | Role |
//! |---|---|
//! | `router` | central broker (forwarder or direct-pair mode) |
//! | `bridge` | board adapter on a simulated Arduino, BeagleBone or Raspberry Pi |
//! | `http` | polling HTTP front-end on port 50208 |
//! | `monitor` | print every envelope the router sends out |
//! | `adxl345` | i2c accelerometer client |
//! | `init` | write `~/.backplane/config.toml` with defaults |
//!
//! Every role runs on a single-threaded tokio runtime. **Ctrl-C** (or
//! SIGTERM) requests shutdown; each role closes its sockets and releases its
//! device before exiting.

mod config;

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use backplane_devices::adxl345::DEFAULT_READ_TIMEOUT;
use backplane_devices::{Adxl345, Sample, Target};
use backplane_hal::{Platform, ServoPolarity, SimBoard};
use backplane_http::{HttpBridge, LinkMode};
use backplane_middleware::{Router, RouterMode, codec, shutdown, transport};
use backplane_runtime::Bridge;
use backplane_types::{BackplaneError, Fields, Message, Topic};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::sync::watch;
use tracing::warn;

use crate::config::Config;

/// Software backplane for Scratch-style hardware control.
#[derive(Parser, Debug)]
#[command(name = "backplane")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Router IP address (overrides the config file).
    #[arg(short, long, global = true)]
    router: Option<String>,

    /// Configuration file [default: ~/.backplane/config.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central router.
    Router {
        /// `forwarder` or `direct-pair` (overrides the config file).
        #[arg(short, long)]
        mode: Option<RouterMode>,
    },
    /// Run a board bridge.
    Bridge {
        /// Board number; commands arrive on `A<board>`, reports leave on `B<board>`.
        #[arg(short, long, default_value_t = 1)]
        board: u16,
        #[arg(short, long, value_enum, default_value_t = PlatformArg::Arduino)]
        platform: PlatformArg,
        /// BeagleBone only: servo duty cycle is not inverted.
        #[arg(long)]
        normal_polarity: bool,
    },
    /// Run the HTTP front-end.
    Http {
        /// `pub-sub` (router in forwarder mode) or `pair` (router in direct-pair mode).
        #[arg(short, long, default_value = "pub-sub")]
        link: LinkMode,
    },
    /// Print every envelope published by the router.
    Monitor {
        /// Topic prefix; empty means everything.
        #[arg(short, long, default_value = "")]
        topic: String,
        /// One JSON object per line.
        #[arg(long)]
        json: bool,
    },
    /// Read an ADXL345 accelerometer through a bridge's i2c bus.
    Adxl345 {
        /// Board whose bridge owns the device; omit to broadcast on `Q`.
        #[arg(short, long)]
        board: Option<u16>,
        /// Also publish each sample on this topic.
        #[arg(long)]
        republish: Option<String>,
        /// Stop after this many reads; omit to read until Ctrl-C.
        #[arg(short, long)]
        count: Option<u64>,
        /// Pause between reads, in milliseconds.
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformArg {
    Arduino,
    Beaglebone,
    Raspberrypi,
}

impl PlatformArg {
    fn platform(self, normal_polarity: bool) -> Platform {
        match self {
            PlatformArg::Arduino => Platform::Arduino,
            PlatformArg::Beaglebone => Platform::BeagleBone {
                polarity: if normal_polarity {
                    ServoPolarity::Normal
                } else {
                    ServoPolarity::Inverted
                },
            },
            PlatformArg::Raspberrypi => Platform::RaspberryPi,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Command::Init { force } => init(args.config, force),
        command => {
            let mut cfg = match config::resolve(args.config.as_deref()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("{}: {e}", "Config error".red());
                    return ExitCode::FAILURE;
                }
            };
            if let Some(router) = args.router {
                cfg.router_address = router;
            }
            run(command, cfg)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ BackplaneError::Bind { .. }) => {
            eprintln!("{} {e}", "✗".red().bold());
            eprintln!("  Is another instance already running on that port?");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{} {e}", "✗".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, mut cfg: Config) -> Result<(), BackplaneError> {
    let role = role_name(&command);
    let _guard = backplane_runtime::init_tracing(&format!("backplane-{role}"));
    let monitor_json = matches!(command, Command::Monitor { json: true, .. });
    if !monitor_json {
        print_banner(role, &cfg);
    }
    let rx = install_shutdown_handler();

    match command {
        Command::Router { mode } => {
            if let Some(mode) = mode {
                cfg.router_mode = mode;
            }
            println!(
                "  Mode {}: publish port {}, subscribe port {}, pair port {}\n",
                cfg.router_mode.to_string().bold(),
                cfg.publish_port,
                cfg.subscribe_port,
                cfg.pair_port
            );
            block_on(Router::new(cfg.router_config()).run(rx))
        }
        Command::Bridge {
            board,
            platform,
            normal_polarity,
        } => block_on(run_bridge(cfg, board, platform.platform(normal_polarity), rx)),
        Command::Http { link } => {
            println!(
                "  Polling clients connect to {}\n",
                format!("http://localhost:{}/poll", cfg.http_port).bold()
            );
            block_on(HttpBridge::new(cfg.http_config(link)).run(rx))
        }
        Command::Monitor { topic, json } => block_on(run_monitor(cfg, topic, json, rx)),
        Command::Adxl345 {
            board,
            republish,
            count,
            interval_ms,
        } => {
            let target = board.map_or(Target::Broadcast, Target::Board);
            let interval = Duration::from_millis(interval_ms);
            block_on(run_adxl345(cfg, target, republish, count, interval, rx))
        }
        Command::Init { .. } => Ok(()),
    }
}

fn role_name(command: &Command) -> &'static str {
    match command {
        Command::Router { .. } => "router",
        Command::Bridge { .. } => "bridge",
        Command::Http { .. } => "http",
        Command::Monitor { .. } => "monitor",
        Command::Adxl345 { .. } => "adxl345",
        Command::Init { .. } => "init",
    }
}

fn block_on<F>(future: F) -> Result<(), BackplaneError>
where
    F: Future<Output = Result<(), BackplaneError>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BackplaneError::Transport(format!("failed to start runtime: {e}")))?;
    runtime.block_on(future)
}

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown
// ─────────────────────────────────────────────────────────────────────────────

fn install_shutdown_handler() -> watch::Receiver<bool> {
    let (trigger, rx) = shutdown::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown requested – closing sockets …".yellow().bold());
        trigger.trigger();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; only a kill will stop this process");
    }
    rx
}

// ─────────────────────────────────────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────────────────────────────────────

async fn run_bridge(
    cfg: Config,
    board: u16,
    platform: Platform,
    rx: watch::Receiver<bool>,
) -> Result<(), BackplaneError> {
    if board == 0 || board > cfg.report_boards {
        warn!(
            board,
            report_boards = cfg.report_boards,
            "board outside the relayed range; front-ends will not see its reports"
        );
    }
    let (publisher, pub_t) = transport::connect_publisher(&cfg.publish_addr(), cfg.reconnect());
    let (subscriber, sub_t) = transport::connect_subscriber(&cfg.subscribe_addr(), cfg.reconnect());

    println!(
        "  Board {} on a simulated {} board\n",
        board.to_string().bold(),
        platform.name().bold()
    );
    let driver = SimBoard::for_platform(platform);
    let bridge = Bridge::start(cfg.bridge_config(board), Box::new(driver), subscriber, publisher)?;
    let result = bridge.run(rx).await;

    sub_t.shutdown();
    pub_t.shutdown();
    result
}

async fn run_monitor(
    cfg: Config,
    prefix: String,
    json: bool,
    mut rx: watch::Receiver<bool>,
) -> Result<(), BackplaneError> {
    let (mut subscriber, sub_t) = transport::connect_subscriber(&cfg.subscribe_addr(), cfg.reconnect());
    subscriber.subscribe(Topic::from(prefix.as_str()));

    loop {
        let message = tokio::select! {
            message = subscriber.recv() => message,
            _ = shutdown::wait(&mut rx) => break,
        };
        let Some(message) = message else {
            break;
        };
        let now = chrono::Utc::now();
        if json {
            println!("{}", envelope_json(&message, now));
        } else {
            println!(
                "{} {} {}",
                now.format("%H:%M:%S%.3f").to_string().dimmed(),
                message.topic.to_string().bold(),
                describe(&message)
            );
        }
    }

    sub_t.shutdown();
    Ok(())
}

async fn run_adxl345(
    cfg: Config,
    target: Target,
    republish: Option<String>,
    count: Option<u64>,
    interval: Duration,
    mut rx: watch::Receiver<bool>,
) -> Result<(), BackplaneError> {
    let (publisher, pub_t) = transport::connect_publisher(&cfg.publish_addr(), cfg.reconnect());
    let (subscriber, sub_t) = transport::connect_subscriber(&cfg.subscribe_addr(), cfg.reconnect());

    let mut device = Adxl345::new(target, publisher, subscriber);
    if let Some(topic) = republish {
        device = device.with_republish(topic);
    }
    device.initialize()?;

    let joined = match count {
        Some(count) => {
            let rx = rx.clone();
            tokio::task::spawn_blocking(move || read_samples(device, count, interval, &rx)).await
        }
        None => {
            let reader = device.start_continuous(Some(interval), Some(Box::new(print_sample)))?;
            shutdown::wait(&mut rx).await;
            tokio::task::spawn_blocking(move || reader.stop().map(drop)).await
        }
    };

    sub_t.shutdown();
    pub_t.shutdown();
    joined.map_err(|e| BackplaneError::Device(format!("adxl345 reader failed: {e}")))?
}

fn read_samples(
    mut device: Adxl345,
    count: u64,
    interval: Duration,
    rx: &watch::Receiver<bool>,
) -> Result<(), BackplaneError> {
    for n in 0..count {
        if shutdown::requested(rx) {
            break;
        }
        match device.read_once(DEFAULT_READ_TIMEOUT) {
            Ok(sample) => print_sample(&sample),
            Err(BackplaneError::Device(e)) => warn!(error = %e, "no sample"),
            Err(e) => return Err(e),
        }
        if n + 1 < count {
            std::thread::sleep(interval);
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_sample(sample: &Sample) {
    println!(
        "  B{} x={:+.4}g y={:+.4}g z={:+.4}g  pitch {:>4}°  roll {:>4}°",
        sample.board, sample.x_g, sample.y_g, sample.z_g, sample.pitch, sample.roll
    );
}

/// `key=value` pairs with `command` first, or the decode error.
fn describe(message: &Message) -> String {
    match codec::decode(message) {
        Ok((_, fields)) => describe_fields(&fields),
        Err(e) => format!("<{} bytes: {e}>", message.payload.len()),
    }
}

fn describe_fields(fields: &Fields) -> String {
    let command = fields.command().unwrap_or_default();
    let rest = fields
        .iter()
        .filter(|(key, _)| key.as_str() != Fields::COMMAND)
        .map(|(key, value)| format!("{key}={}", value.render().escape_debug()))
        .collect::<Vec<_>>();
    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", rest.join(" "))
    }
}

fn envelope_json(message: &Message, now: chrono::DateTime<chrono::Utc>) -> serde_json::Value {
    let timestamp = now.to_rfc3339();
    let topic = message.topic.to_string();
    match codec::decode(message) {
        Ok((_, fields)) => serde_json::json!({
            "timestamp": timestamp,
            "topic": topic,
            "fields": fields,
        }),
        Err(e) => serde_json::json!({
            "timestamp": timestamp,
            "topic": topic,
            "error": e.to_string(),
            "bytes": message.payload.len(),
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Init
// ─────────────────────────────────────────────────────────────────────────────

fn init(path: Option<PathBuf>, force: bool) -> Result<(), BackplaneError> {
    let path = path.unwrap_or_else(config::config_path);
    if path.exists() && !force {
        return Err(BackplaneError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config::save_to(&Config::default(), &path)?;
    println!(
        "\n  {} Config saved to {}\n",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(role: &str, cfg: &Config) {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", format!("  ║  {:<36}║", format!("backplane {role}")).bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!(
        "  {} {}",
        "backplane".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Using router address {}", cfg.router_address.bold());
    println!(
        "  {}",
        "To specify some other address for the router, use the -r option.".dimmed()
    );
    println!();
}
