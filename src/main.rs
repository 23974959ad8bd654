mod config;
mod dns;
mod engine;
mod error;
mod packet;
mod relay;
mod reply;
mod session;
mod tunnel;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::relay::UdpRelay;
use crate::tunnel::FdTunnel;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS relay for a point-to-point tunnel interface", long_about = None)]
struct Args {
    /// Config file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/relay.json")]
    config: PathBuf,
    /// File descriptor of the already configured tunnel interface
    #[arg(long = "tun-fd")]
    tun_fd: i32,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// Emit logs as JSON
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let cfg = load_config(&args.config).context("load initial config")?;
    UdpRelay::from_settings(&cfg.settings).context("validate relay settings")?;
    info!(
        upstream = %cfg.settings.upstream,
        tun_fd = args.tun_fd,
        checksums = cfg.settings.compute_checksums,
        "dns relay starting"
    );

    let config = Arc::new(ArcSwap::from_pointee(cfg));
    watcher::spawn(args.config.clone(), config.clone());

    let tun_fd = args.tun_fd;
    let supervisor = session::supervise(
        config,
        move || FdTunnel::from_inherited(tun_fd),
        UdpRelay::from_settings,
    );

    tokio::select! {
        res = supervisor => {
            if let Err(err) = &res {
                error!(error = %err, "relay stopped");
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_target(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}
