//! Echo server and ping client built on the messenger
//!
//! Usage:
//!   rpc_echo --listen 127.0.0.1:7100
//!   rpc_echo --ping 127.0.0.1:7100 --count 100
//!   rpc_echo --config config/messenger.toml --listen 0.0.0.0:7100

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use rpc::{
    ErrorCode, InboundCall, MessengerBuilder, MessengerConfig, RemoteMethod, RpcError, RpcService,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ECHO_SERVICE: &str = "echo";

#[derive(Parser, Debug)]
#[command(name = "rpc_echo")]
#[command(about = "Echo server and ping client for the RPC messenger")]
#[command(version)]
struct Args {
    /// Address to serve the echo service on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Server to ping
    #[arg(short, long)]
    ping: Option<SocketAddr>,

    /// Number of pings to send
    #[arg(long, default_value_t = 10)]
    count: usize,

    /// Ping payload size in bytes
    #[arg(long, default_value_t = 32)]
    payload_size: usize,

    /// Per-call timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Messenger configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of reactors
    #[arg(long)]
    reactors: Option<usize>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

struct EchoService;

impl RpcService for EchoService {
    fn handle(&self, call: InboundCall) {
        match call.method_name() {
            "Echo" => {
                let payload = call.payload().clone();
                call.respond_success(payload);
            }
            other => {
                let error = RpcError::remote(
                    ErrorCode::NoSuchMethod,
                    format!("Method {} not found on {}", other, ECHO_SERVICE),
                );
                call.respond_failure(ErrorCode::NoSuchMethod, &error);
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if args.listen.is_none() && args.ping.is_none() {
        bail!("Nothing to do: pass --listen and/or --ping");
    }

    let mut config = MessengerConfig::load(args.config.as_deref())
        .context("Failed to load messenger configuration")?;
    if let Some(reactors) = args.reactors {
        config.num_reactors = reactors;
    }
    if config.name == MessengerConfig::default().name {
        config.name = "rpc_echo".to_string();
    }

    let messenger = MessengerBuilder::from_config(config)
        .server_event_listener(|remote, event| {
            info!(remote = %remote, bytes = event.len(), "Server event received");
        })
        .build()
        .context("Failed to build messenger")?;

    if let Some(listen) = args.listen {
        messenger.register_service(ECHO_SERVICE, Arc::new(EchoService))?;
        let bound = messenger.listen_address(listen)?;
        messenger.start_acceptor()?;
        info!(address = %bound, "Echo service listening");
    }

    if let Some(target) = args.ping {
        ping(&messenger, target, &args)?;
    }

    if args.listen.is_some() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(tokio::signal::ctrl_c())
            .context("Failed to install CTRL+C handler")?;
        info!("Received shutdown signal");
    }

    let snapshot = messenger.metrics().snapshot();
    messenger.shutdown();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn ping(messenger: &rpc::Messenger, target: SocketAddr, args: &Args) -> Result<()> {
    let payload = Bytes::from(vec![0xAB; args.payload_size]);
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut failures = 0;

    for seq in 0..args.count {
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        messenger.call(
            target,
            RemoteMethod::new(ECHO_SERVICE, "Echo"),
            payload.clone(),
            timeout,
            move |result| {
                let _ = tx.send(result);
            },
        );

        match rx.recv()? {
            Ok(response) if response == payload => {
                info!(seq, rtt_us = start.elapsed().as_micros() as u64, "Pong");
            }
            Ok(response) => {
                failures += 1;
                warn!(seq, bytes = response.len(), "Pong payload mismatch");
            }
            Err(e) => {
                failures += 1;
                warn!(seq, error = %e, "Ping failed");
            }
        }
    }

    info!(sent = args.count, failures, "Ping finished");
    if failures > 0 {
        bail!("{} of {} pings failed", failures, args.count);
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
