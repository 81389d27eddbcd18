//! Palette Relayer - bidirectional relay between the Palette chain and the
//! Poly relay chain.
//!
//! Mirrors block headers carrying validator-set transitions in both
//! directions and replays cross-chain events with Merkle inclusion proofs.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

mod chain;
mod codec;
mod config;
mod error;
mod manager;
mod metrics;
mod store;

use chain::{PaletteClient, PolyClient, PolySigner};
use config::ServiceConfig;
use manager::{PaletteManager, PolyManager};
use store::Store;

#[derive(Parser)]
#[command(name = "palette-relayer", version, about = "Palette <-> Poly cross-chain relayer")]
struct Args {
    /// Log verbosity: 0=error, 1=warn, 2=info, 3=debug, 4=trace
    #[arg(long, default_value_t = 2)]
    loglevel: u8,
    /// Path of the JSON configuration file
    #[arg(long, default_value = "config.json")]
    cliconfig: PathBuf,
    /// Palette start height override
    #[arg(long, default_value_t = 0)]
    plt: u64,
    /// Force the Palette checkpoint down to this height
    #[arg(long, default_value_t = 0)]
    pltforce: u64,
    /// Poly start height override
    #[arg(long, default_value_t = 0)]
    poly: u32,
    /// Shortcut for debug-level logging
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Also write logs into this directory
    #[arg(long)]
    logdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    info!("palette relayer v{} starting", env!("CARGO_PKG_VERSION"));

    let config = ServiceConfig::load(&args.cliconfig)
        .with_context(|| format!("load config {}", args.cliconfig.display()))?;

    let signer = PolySigner::open(&config.poly.wallet_file, &config.poly.wallet_pwd)
        .context("open poly wallet")?;
    info!(
        "poly signer address: {}",
        codec::keys::addr_to_base58(signer.address())
    );
    let poly = Arc::new(PolyClient::connect(&config.poly.rest_url, signer));

    let palette = PaletteClient::connect(
        &config.palette.rest_url,
        config.palette.eccm_contract_address,
        config.palette.eccd_contract_address,
    )
    .context("dial palette node")?;
    let palette = Arc::new(palette);

    let store = Store::open(config.db_path()).context("open database")?;

    let poly_manager = PolyManager::new(
        config.clone(),
        args.poly,
        palette.clone(),
        poly.clone(),
        store.clone(),
    )
    .await
    .context("start poly manager")?;

    let palette_manager = PaletteManager::new(
        config.clone(),
        args.plt,
        args.pltforce,
        palette,
        poly,
        store,
    )
    .await
    .context("start palette manager")?;

    let (shutdown, _) = broadcast::channel(4);
    let mut handles = poly_manager.spawn(&shutdown);
    handles.extend(palette_manager.spawn(&shutdown));

    if let Some(port) = config.metrics_port {
        tokio::spawn(async move {
            if let Err(e) = metrics::run_server(port).await {
                error!("metrics server: {e}");
            }
        });
    }

    info!("palette relayer is running");
    shutdown_signal().await;

    info!("exit signal received, stopping");
    let _ = shutdown.send(());
    for handle in handles {
        let _ = handle.await;
    }

    info!("palette relayer stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if args.debug {
        "debug"
    } else {
        match args.loglevel {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,palette_relayer={level}")));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true));

    if let Some(dir) = &args.logdir {
        let appender = tracing_appender::rolling::daily(dir, "relayer.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Ok(Some(guard))
    } else {
        registry.init();
        Ok(None)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = hangup => {},
    }
}
