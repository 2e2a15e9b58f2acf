//! dxhub broker binary.
//!
//! Central channel registry for the data-exchange hub (§4.4): binds a ZMQ
//! ROUTER socket, serves the REG/HEARTBEAT/DISC/REGCON/DEREG protocol, and
//! runs the heartbeat/liveness sweep once per poll tick on the same
//! single-threaded main loop.

use anyhow::{Context, Result};
use clap::Parser;
use dxhub_broker::config::BrokerConfig;
use dxhub_broker::registry::{ChannelRegistry, Outgoing};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dxhub_broker")]
#[command(about = "Central channel registry for the dxhub data-exchange hub", long_about = None)]
struct Args {
    /// ZMQ ROUTER bind endpoint, e.g. tcp://0.0.0.0:5570
    #[arg(short, long)]
    bind: Option<String>,

    /// Optional TOML config file (see BrokerConfig)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel heartbeat timeout in milliseconds
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = BrokerConfig::load(args.config.as_deref())?;

    let filter = if args.verbose { "dxhub_broker=debug,info" } else { "dxhub_broker=info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_endpoint = args.bind.unwrap_or_else(|| config.bind_endpoint.clone());
    let heartbeat_timeout = Duration::from_millis(args.heartbeat_timeout_ms.unwrap_or(config.heartbeat_timeout_ms));
    let poll_timeout_ms = config.poll_timeout_ms;

    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::ROUTER).context("creating ROUTER socket")?;

    if let Some(secret_path) = &config.curve_secret_key_path {
        let secret_key = std::fs::read(secret_path).context("reading curve secret key")?;
        socket.set_curve_server(true).context("enabling CurveZMQ server mode")?;
        socket.set_curve_secretkey(&secret_key).context("setting curve secret key")?;
        tracing::info!("CurveZMQ authentication enabled");
    }

    socket.bind(&bind_endpoint).with_context(|| format!("binding ROUTER socket to {bind_endpoint}"))?;
    tracing::info!("dxhub_broker listening on {bind_endpoint}");

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        if handler_flag.swap(false, Ordering::SeqCst) {
            tracing::warn!("shutdown requested, finishing current poll tick");
        } else {
            tracing::warn!("second interrupt received, forcing immediate exit");
            std::process::exit(1);
        }
    })
    .context("installing signal handler")?;

    let mut registry = ChannelRegistry::new(heartbeat_timeout);

    while running.load(Ordering::SeqCst) {
        let mut items = [socket.as_poll_item(zmq::POLLIN)];
        if zmq::poll(&mut items, poll_timeout_ms).unwrap_or(0) > 0 && items[0].is_readable() {
            match socket.recv_multipart(0) {
                Ok(parts) if parts.len() >= 3 && parts[1] == dxhub_core::channel::FRAME_CONTROL => {
                    let identity = parts[0].clone();
                    let frame_type = String::from_utf8_lossy(&parts[2]).into_owned();
                    let body: Value = parts.get(3).and_then(|b| serde_json::from_slice(b).ok()).unwrap_or(Value::Null);
                    for out in registry.handle_request(identity, &frame_type, body) {
                        send_reply(&socket, out);
                    }
                }
                Ok(_) => tracing::warn!("dxhub_broker: malformed request frame, ignoring"),
                Err(e) => tracing::error!("dxhub_broker: recv error: {e}"),
            }
        }

        for out in registry.sweep() {
            send_reply(&socket, out);
        }
    }

    tracing::info!("dxhub_broker shutdown complete");
    Ok(())
}

fn send_reply(socket: &zmq::Socket, out: Outgoing) {
    let bytes = match serde_json::to_vec(&out.body) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("dxhub_broker: failed to encode {} reply: {e}", out.frame_type);
            return;
        }
    };
    if let Err(e) = dxhub_core::channel::send_ctrl(socket, out.frame_type, &bytes, Some(&out.identity)) {
        tracing::warn!("dxhub_broker: failed to send {}: {e}", out.frame_type);
    }
}
