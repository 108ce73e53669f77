//! ModelPool Worker - Main Entry Point
//!
//! Spawned by the coordinator with `--model-path` and `--user-id`.
//! Protocol traffic uses stdout; all logging goes to stderr.

use anyhow::{bail, Result};
use clap::Parser;
use modelpool_proto::DEFAULT_READY_LINE;
use modelpool_worker::{serve, Responder, ServeOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "modelpool-worker", about = "Reference inference worker for ModelPool")]
struct Args {
    /// Model artifact to serve
    #[arg(long)]
    model_path: PathBuf,

    /// Owner of the model
    #[arg(long)]
    user_id: String,

    /// Line printed once the model is ready
    #[arg(long, default_value = DEFAULT_READY_LINE)]
    ready_line: String,

    /// Delay before each streamed word, in milliseconds
    #[arg(long, default_value_t = 0)]
    chunk_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelpool_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        "Starting ModelPool Worker for {} (pid={})",
        args.user_id,
        std::process::id()
    );

    if !args.model_path.exists() {
        bail!("model path {} does not exist", args.model_path.display());
    }
    info!("Model loaded from {}", args.model_path.display());

    let mut stdout = tokio::io::stdout();
    stdout.write_all(args.ready_line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    let options = ServeOptions {
        chunk_delay: Duration::from_millis(args.chunk_delay_ms),
    };
    let served = serve(
        BufReader::new(tokio::io::stdin()),
        stdout,
        &Responder::new(args.user_id.clone()),
        &options,
    )
    .await?;

    info!("ModelPool Worker shutdown after {} requests", served);
    Ok(())
}
