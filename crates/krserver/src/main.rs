//
// main.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Main binary entry point for the kernel relay server.

#![allow(missing_docs)]

use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, ArgAction, Parser};
use log::LevelFilter;
use rand::Rng;
use serde::Serialize;
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use krserver::config::{CullConfig, RateLimitConfig, RelayConfig, ServerConfig};
use krserver::kernel_manager::ZmqKernelManager;
use krserver::kernel_spec::KernelSpecStore;
use krserver::server::{self, ServerState};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The port to bind the server to; 0 picks any free port
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// The IP address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// File holding the token clients must present. The file is deleted once
    /// read. Pass "none" to turn authentication off; when omitted a random
    /// token is generated and logged.
    #[arg(short, long)]
    token: Option<String>,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<String>,

    /// Log verbosity (trace, debug, info, warn, error). Falls back to
    /// `RUST_LOG`, then to info.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Once listening, write the server's address, PID, and token to this file
    #[arg(long)]
    connection_file: Option<String>,

    /// A directory of kernel specs, laid out as `<name>/kernel.json`
    #[arg(long, env = "JUPYTER_KERNEL_DIR")]
    kernel_dir: Option<PathBuf>,

    /// The kernel spec to start when a request names none
    #[arg(long)]
    default_kernel: Option<String>,

    /// The IP address kernels are told to bind their sockets to
    #[arg(long, default_value = "127.0.0.1")]
    kernel_ip: String,

    /// Minutes a kernel may sit idle before it is shut down; 0 disables culling
    #[arg(long, env = "KR_CULL_IDLE_TIMEOUT", default_value_t = 0)]
    cull_idle_timeout: u64,

    /// Seconds between checks for idle kernels
    #[arg(long, env = "KR_CULL_INTERVAL", default_value_t = 300)]
    cull_interval: u64,

    /// Whether kernels reporting `busy` may be culled
    #[arg(long, env = "KR_CULL_BUSY", default_value_t = false, action = ArgAction::Set)]
    cull_busy: bool,

    /// Whether kernels with connected clients may be culled
    #[arg(long, env = "KR_CULL_CONNECTED", default_value_t = false, action = ArgAction::Set)]
    cull_connected: bool,

    /// Maximum iopub messages per second sent to a client; 0 is unlimited
    #[arg(long, env = "KR_IOPUB_MSG_RATE_LIMIT", default_value_t = 1000.0)]
    iopub_msg_rate_limit: f64,

    /// Maximum iopub bytes per second sent to a client; 0 is unlimited
    #[arg(long, env = "KR_IOPUB_DATA_RATE_LIMIT", default_value_t = 1_000_000.0)]
    iopub_data_rate_limit: f64,

    /// Seconds over which iopub rates are averaged
    #[arg(long, env = "KR_RATE_LIMIT_WINDOW", default_value_t = 1.0)]
    rate_limit_window: f64,

    /// Seconds to wait for a kernel_info_reply when a client connects
    #[arg(long, env = "KR_KERNEL_INFO_TIMEOUT", default_value_t = 10.0)]
    kernel_info_timeout: f64,

    /// Seconds between websocket pings; 0 disables pings
    #[arg(long, env = "KR_WS_PING_INTERVAL", default_value_t = 30)]
    ws_ping_interval: u64,
}

impl Args {
    fn server_config(&self, token: Option<String>) -> ServerConfig {
        let kernel_info_timeout = if self.kernel_info_timeout > 0.0 {
            Duration::from_secs_f64(self.kernel_info_timeout)
        } else {
            RelayConfig::default().kernel_info_timeout
        };
        ServerConfig {
            relay: RelayConfig {
                rate_limit: RateLimitConfig::new(
                    self.iopub_msg_rate_limit,
                    self.iopub_data_rate_limit,
                    self.rate_limit_window,
                ),
                kernel_info_timeout,
                ping_interval: match self.ws_ping_interval {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
            cull: CullConfig {
                idle_timeout_minutes: self.cull_idle_timeout,
                interval: Duration::from_secs(self.cull_interval.max(1)),
                cull_busy: self.cull_busy,
                cull_connected: self.cull_connected,
            },
            kernel_dir: self.kernel_dir.clone(),
            default_kernel: self.default_kernel.clone(),
            kernel_ip: self.kernel_ip.clone(),
            token,
        }
    }
}

fn init_logging(args: &Args) {
    let requested = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| String::from("info"));
    let level = LevelFilter::from_str(&requested).unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', logging at info", requested);
        LevelFilter::Info
    });

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    if let Some(path) = &args.log_file {
        match File::create(path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(err) => {
                eprintln!("Cannot create log file {}: {}", path, err);
                std::process::exit(1);
            }
        }
    }

    if let Err(err) = CombinedLogger::init(loggers) {
        eprintln!("Cannot initialize logging: {}", err);
        std::process::exit(1);
    }
}

/// Work out the auth token from the `--token` argument.
fn read_token(arg: &Option<String>) -> Result<Option<String>, anyhow::Error> {
    let Some(token_file) = arg else {
        let mut rng = rand::thread_rng();
        let token: String = (0..8)
            .map(|_| format!("{:02x}", rng.gen::<u8>()))
            .collect();
        log::info!("Generated random auth token: {}", token);
        return Ok(Some(token));
    };

    if token_file == "none" {
        log::warn!("Running without authentication; any local client may connect");
        return Ok(None);
    }

    let token = std::fs::read_to_string(token_file)
        .map_err(|err| anyhow::anyhow!("Failed to read token file '{}': {}", token_file, err))?;
    let token = token.trim().to_string();

    // The token travels in an HTTP header
    if token.len() > 64 {
        anyhow::bail!("Auth token is too long (max 64 characters)");
    }

    // The file's path shows up in the process list, so don't leave the token
    // lying around
    if let Err(err) = std::fs::remove_file(token_file) {
        log::warn!("Failed to delete token file '{}': {}", token_file, err);
    }

    log::debug!("Read auth token from {}", token_file);
    Ok(Some(token))
}

/// How a launcher finds and authenticates to a running server.
#[derive(Serialize)]
struct ListeningAt<'a> {
    port: u16,
    base_path: String,
    server_pid: u32,
    bearer_token: Option<&'a str>,
    log_path: Option<&'a str>,
}

fn write_server_connection_file(
    path: &str,
    addr: SocketAddr,
    token: &Option<String>,
    log_file: &Option<String>,
) -> Result<(), anyhow::Error> {
    let listening = ListeningAt {
        port: addr.port(),
        base_path: format!("http://{}", addr),
        server_pid: std::process::id(),
        bearer_token: token.as_deref(),
        log_path: log_file.as_deref(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&listening)?)?;
    Ok(())
}

fn load_kernel_specs(config: &ServerConfig) -> KernelSpecStore {
    let mut specs = match &config.kernel_dir {
        Some(dir) => match KernelSpecStore::from_dir(dir) {
            Ok(specs) => specs,
            Err(err) => {
                log::error!("Failed to read kernel specs from {}: {}", dir.display(), err);
                KernelSpecStore::default()
            }
        },
        None => {
            log::warn!("No kernel spec directory given; kernels cannot be started");
            KernelSpecStore::default()
        }
    };
    if let Some(name) = &config.default_kernel {
        if specs.get(name).is_none() {
            log::warn!("Default kernel '{}' is not among the kernel specs", name);
        }
    }
    specs.set_default(config.default_kernel.clone());
    specs
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let token = match read_token(&args.token) {
        Ok(token) => token,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };

    let config = args.server_config(token);
    let specs = load_kernel_specs(&config);
    let manager = match ZmqKernelManager::new(specs, &config) {
        Ok(manager) => manager,
        Err(err) => {
            log::error!("Failed to create kernel manager: {}", err);
            std::process::exit(1);
        }
    };

    // Resolve port 0 up front so the connection file names the real port
    let port = match args.port {
        0 => match portpicker::pick_unused_port() {
            Some(port) => port,
            None => {
                log::error!("No free port available");
                std::process::exit(1);
            }
        },
        port => port,
    };
    let addr = SocketAddr::new(args.ip, port);

    println!(
        "krserver {}: relaying Jupyter kernels on http://{}",
        env!("CARGO_PKG_VERSION"),
        addr
    );

    if let Some(connection_file_path) = &args.connection_file {
        if let Err(err) =
            write_server_connection_file(connection_file_path, addr, &config.token, &args.log_file)
        {
            log::error!("Failed to write connection file: {}", err);
            std::process::exit(1);
        }
        log::info!("Wrote connection details to {}", connection_file_path);
    }

    let state = Arc::new(ServerState::new(
        manager.clone(),
        config.relay.clone(),
        config.token.clone(),
    ));

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
        log::info!("Shutting down");
    };

    if let Err(err) = server::serve(addr, state, shutdown).await {
        log::error!("Server error: {}", err);
    }

    manager.shutdown_all().await;
}
