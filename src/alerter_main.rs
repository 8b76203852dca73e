use anyhow::Result;
use tracing::{info, error};
use std::sync::Arc;
use tokio::signal;

use log_alerter::config::{Config, LoggingConfig};
use log_alerter::pipeline::Alerter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration errors are fatal before anything starts
    let config = Config::load()?;

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_logging(&config.logging)?;

    info!("Starting log alerter v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded successfully");

    let alerter = Arc::new(Alerter::new(config).await?);
    let alerter_clone = alerter.clone();

    // Handle shutdown signals
    let shutdown_handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Received shutdown signal");
                alerter_clone.shutdown();
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    // Runs until shutdown or until a finite source is drained
    if let Err(e) = alerter.run().await {
        error!("Alerter error: {:#}", e);
        shutdown_handle.abort();
        return Err(e);
    }

    shutdown_handle.abort();
    info!("Log alerter shut down");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

fn init_logging(config: &LoggingConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout);

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;

            // Daily JSON log file next to the console output
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(directory)?;
            let (writer, guard) = tracing_appender::non_blocking(file_appender);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}
