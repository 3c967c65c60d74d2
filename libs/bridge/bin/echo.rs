//! Echo service demo - spawns a background actor and round-trips requests
//!
//! Usage:
//!   bridge-echo --count 5
//!   bridge-echo --config bridge.toml --log-level debug
//!   bridge-echo --backend inproc
//!
//! Built with the `libzmq` feature it runs on libzmq by default.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use native::{Backend, InprocBackend};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use zmq_bridge::{BridgeConfig, Close, Module, Service, Worker};

#[derive(Parser, Debug)]
#[command(name = "bridge-echo")]
#[command(about = "Round-trip requests through a background echo actor")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 3)]
    count: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Messaging library to run on
    #[arg(short, long, value_enum, default_value_t = BackendKind::default())]
    backend: BackendKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// libzmq (needs the `libzmq` feature)
    Zmq,
    /// In-process double, `inproc://` only
    Inproc,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "libzmq") {
            BackendKind::Zmq
        } else {
            BackendKind::Inproc
        }
    }
}

impl BackendKind {
    fn open(self) -> Result<Arc<dyn Backend>> {
        match self {
            BackendKind::Inproc => Ok(Arc::new(InprocBackend::new())),
            #[cfg(feature = "libzmq")]
            BackendKind::Zmq => {
                let (major, minor, patch) = native::ZmqBackend::version();
                info!("using libzmq {major}.{minor}.{patch}");
                Ok(Arc::new(native::ZmqBackend::new()))
            }
            #[cfg(not(feature = "libzmq"))]
            BackendKind::Zmq => anyhow::bail!("bridge-echo was built without the libzmq feature"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoArgs {
    prefix: String,
}

struct Echo {
    prefix: String,
    served: u32,
}

impl Service for Echo {
    type Args = EchoArgs;
    type Request = String;
    type Response = String;

    fn new(args: EchoArgs, worker: &Worker) -> anyhow::Result<Self> {
        info!(thread = %worker.id(), "echo actor started");
        Ok(Self {
            prefix: args.prefix,
            served: 0,
        })
    }

    fn handle(&mut self, request: String) -> anyhow::Result<String> {
        self.served += 1;
        Ok(format!("{}{}", self.prefix, request))
    }

    fn finalize(&mut self) {
        info!(served = self.served, "echo actor stopping");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = BridgeConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let module = Module::with_config(args.backend.open()?, config)?;

    let host = module.service::<Echo>()?;
    {
        let echo = host.create(&EchoArgs {
            prefix: "echo: ".to_string(),
        })?;
        for n in 0..args.count {
            let reply = echo.call(&format!("request {n}"))?;
            info!("{}", reply);
        }
        echo.finalize()?;
    }

    host.close(Close::Blocking)?;
    module.finalize()?;
    Ok(())
}

fn init_logging(args: &Args) {
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    if args.json_logs {
        tracing_subscriber::fmt().json().with_max_level(log_level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(log_level).init();
    }
}
