use std::sync::Arc;

use sumo_relay::buffer::LogBuffer;
use sumo_relay::config::{Config, Source};
use sumo_relay::flush::FlushDriver;
use sumo_relay::sources::journal::JournalReader;
use sumo_relay::sources::{SourceError, file};
use sumo_relay::uploader::HttpUploader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exceptional init failure, log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("SUMO_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid SUMO_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        fatal("failed to install rustls ring provider", &"provider already set");
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            fatal("failed to install Ctrl+C handler", &e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => fatal("failed to install SIGTERM handler", &e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_source(
    source: Source,
    buffer: LogBuffer,
    cancel: CancellationToken,
) -> Result<(), SourceError> {
    match source {
        Source::File { path, tag } => file::tail(&path, &tag, &buffer, &cancel).await,
        Source::Journal {
            directory,
            name_field,
            window,
        } => {
            JournalReader::new(name_field, window)
                .follow(&directory, &buffer, &cancel)
                .await
        }
    }
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));
    let uploader = HttpUploader::from_config(&config)
        .unwrap_or_else(|e| fatal("failed to build HTTP client", &e));

    // The collector URL embeds its access token; only the host is logged.
    info!(
        collector = config.url.host_str().unwrap_or_default(),
        gzip_threshold = config.gzip_threshold,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "starting relay"
    );

    let buffer = LogBuffer::new(config.buffer_chunk);
    let cancel = CancellationToken::new();

    let driver = FlushDriver::new(buffer.clone(), Arc::new(uploader), config.flush_interval);
    let flusher = tokio::spawn(driver.run(cancel.clone()));
    let mut source = tokio::spawn(run_source(config.source, buffer, cancel.clone()));

    let finished = tokio::select! {
        _ = wait_for_shutdown() => {
            info!("shutdown signal received");
            None
        }
        res = &mut source => Some(res),
    };
    cancel.cancel();
    let outcome = match finished {
        Some(res) => res,
        None => source.await,
    };

    let mut failed = false;
    match outcome {
        Ok(Ok(())) => info!("source finished"),
        Ok(Err(e)) => {
            error!(error = %e, "source failed");
            failed = true;
        }
        Err(e) => {
            error!(error = %e, "source task panicked");
            failed = true;
        }
    }
    if let Err(e) = flusher.await {
        error!(error = %e, "flush task panicked");
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }
}
