//! S3 Spool service
//!
//! Reads records as lines from stdin, buffers them locally and uploads the
//! batches to S3 on a schedule.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/s3-spool.*, /etc/s3-spool/s3-spool.*)
//! 2. Environment variables (prefixed with S3SPOOL__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use s3_spool::config::{LogFormat, ServiceConfig};
use s3_spool::{
    Clock, Compressor, Config, Encoder, GzipCommand, InputFormat, JsonLineEncoder, LineEncoder,
    ObjectNamer, ObjectStore, Pipeline, RunSummary, S3ObjectStore, SpoolBuffer, SystemClock,
    UploadTrigger, Uploader,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Records read ahead of the pipeline before stdin reads block
const RECORD_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    let output = &config.output;
    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        bucket = %output.bucket,
        prefix = %output.prefix,
        buffer_file = %output.buffer_file_path().display(),
        "Starting S3 spool"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(output).await);

    let compressor = output.compression.then(|| {
        Arc::new(GzipCommand::new(output.compression_program.clone())) as Arc<dyn Compressor>
    });
    let buffer = SpoolBuffer::from_config(output, compressor);
    buffer
        .recover()
        .await
        .context("Failed to recover buffer state")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let uploader = Uploader::new(
        store,
        ObjectNamer::new(output.prefix.clone(), output.compression),
        clock.clone(),
    )
    .with_acl(output.acl);
    let trigger = UploadTrigger::new(output.ticker_interval(), clock);

    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_stdin(tx));

    let summary = match config.input.format {
        InputFormat::Lines => {
            let pipeline = Pipeline::new(buffer, uploader, trigger, LineEncoder)
                .flush_on_shutdown(output.flush_on_shutdown);
            drive(pipeline, rx, reader).await
        }
        InputFormat::JsonLines => {
            let pipeline = Pipeline::new(buffer, uploader, trigger, JsonLineEncoder)
                .flush_on_shutdown(output.flush_on_shutdown);
            drive(pipeline, rx, reader).await
        }
    };

    info!(
        records_buffered = summary.records_buffered,
        uploads_succeeded = summary.uploads_succeeded,
        "S3 spool stopped"
    );

    Ok(())
}

/// Run the pipeline until stdin ends or a shutdown signal arrives.
///
/// Stopping the reader drops the sender, which closes the pipeline's input.
/// A blocking stdin read cannot be cancelled, so process exit may still wait
/// for one more line or EOF on an interactive terminal.
async fn drive<E: Encoder<String>>(
    pipeline: Pipeline<String, E>,
    rx: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
) -> RunSummary {
    let run = pipeline.run(rx);
    tokio::pin!(run);

    tokio::select! {
        summary = &mut run => {
            reader.abort();
            summary
        }
        _ = shutdown_signal() => {
            reader.abort();
            run.await
        }
    }
}

/// Forward stdin lines to the pipeline
async fn read_stdin(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("Input reached end of stream");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match service.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
