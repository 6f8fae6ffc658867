//! # Bridge Server
//!
//! TCP JSON bridge in front of a simulated quoting engine.
//!
//! ## Features
//! - Loads classes, securities and accounts from a configuration file.
//! - Random-walks last prices in the background and pushes them to subscribers.
//! - Serves the bridge's extended requests and forwards the rest to the engine.
//! - Calls clients' fast callbacks on every tick.
//! - Optional peer IP allow-list.
//! - Logging support with configurable log levels.
//!
//! ## Command-line Options
//! - `--tcp-addr` / `-t`: TCP listen address (default `127.0.0.1:62787`).
//! - `--config` / `-c`: Path to the engine configuration file.
//! - `--allowed-ips` / `-a`: Comma-separated list of peer IPs; empty allows all.
//! - `--tick-ms`: Engine tick period in milliseconds.
//! - `--log-level` / `-l`: Log level (`error`, `warn`, `info`, `debug`, `trace`).

use quote_bridge::defs::ENGINE_TICK_PERIOD_MSEC;
use quote_bridge::dispatcher::RequestDispatcher;
use quote_bridge::errors::CliError;
use quote_bridge::simulated_engine::SimulatedEngine;
use quote_bridge::tcp_server::TcpServer;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

/// Command-line options for the Bridge Server
#[derive(Debug, StructOpt)]
#[structopt(
    name = "bridge_server",
    about = "TCP JSON bridge to a simulated quoting engine"
)]
struct Opt {
    /// TCP listen address, e.g., 127.0.0.1:62787
    #[structopt(short, long, default_value = "127.0.0.1:62787")]
    tcp_addr: String,

    /// Path to the engine configuration file
    #[structopt(short, long)]
    config: String,

    /// Peer IPs allowed to send requests; empty allows every peer
    #[structopt(short, long, use_delimiter = true)]
    allowed_ips: Vec<String>,

    /// Engine tick period in milliseconds
    #[structopt(long, default_value = "500")]
    tick_ms: u64,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,
}

/// Initializes the logger using env_logger with the given level
fn init_logger(level: &str) {
    let mut builder = env_logger::Builder::new();

    let log_level = match level.to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    builder.filter_level(log_level);
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder.init();
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();

    init_logger(&opt.log_level);

    log::info!("Starting Bridge Server");
    log::debug!("Command line options: {:?}", opt);

    if opt.tick_ms == 0 {
        return Err(CliError::GeneralError("tick period must be positive".into()));
    }
    if opt.tick_ms != ENGINE_TICK_PERIOD_MSEC {
        log::info!("Engine tick period overridden: {}ms", opt.tick_ms);
    }

    log::info!("Loading configuration from: {}", opt.config);
    let engine = SimulatedEngine::from_config(&opt.config)?
        .with_tick_period(Duration::from_millis(opt.tick_ms));
    let engine = Arc::new(engine);

    let dispatcher = Arc::new(RequestDispatcher::new(engine.clone()));
    dispatcher.set_allowed_ips(&opt.allowed_ips);

    log::info!("Starting engine background processing");
    engine.start_background(dispatcher.clone())?;

    let tcp_server = TcpServer::new(&opt.tcp_addr, dispatcher)?;

    log::info!("TCP server initialized. Waiting for client connections...");
    tcp_server.start()?;

    engine.shutdown();
    log::info!("Server shutdown complete");
    Ok(())
}
