//! `rstc`: a thin CLI shell around [`rs_torrent_client::engine::DownloadEngine`].
//! All orchestration logic lives in the library so it stays testable
//! without spawning a process.
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rs_torrent_client::config::Config;
use rs_torrent_client::engine::DownloadEngine;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rstc", about = "A minimal BitTorrent leeching client")]
struct Args {
    /// Path to the .torrent metainfo file.
    torrent: PathBuf,

    /// Destination directory for the downloaded content.
    dest: PathBuf,

    /// Number of concurrent peer workers.
    #[arg(long, default_value_t = 16)]
    workers: usize,

    /// Directory the bitfield sidecar is stored in.
    #[arg(long, default_value = "bitfield")]
    bitfield_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:?}"), "download failed");
            ExitCode::FAILURE
        }
    }
}

/// Builds the config and drives the engine to completion. `thiserror`
/// errors from each layer are composed here via `anyhow`, which is the
/// only place in the crate that needs a blanket error type.
async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::new(
        args.torrent,
        args.dest,
        Some(args.bitfield_dir),
        Some(args.workers),
        None,
    )
    .context("invalid configuration")?;

    let mut engine = DownloadEngine::new(config);
    let progress_handle = tokio::spawn(engine_progress_reporter(engine.progress_handle()));

    let result = engine.start().await.context("engine run failed");
    progress_handle.abort();
    result?;

    tracing::info!("download complete");
    Ok(())
}

/// Periodically logs progress while the engine runs. Runs as a separate
/// task so it doesn't block `engine.start()`'s own completion logic.
async fn engine_progress_reporter(progress: std::sync::Arc<tokio::sync::Mutex<rs_torrent_client::progress::ProgressMeter>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let snapshot = progress.lock().await.snapshot();
        tracing::info!(
            percent = format!("{:.1}", snapshot.percent),
            speed_bps = snapshot.speed_bps,
            "progress"
        );
    }
}
