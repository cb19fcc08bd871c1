mod buffer;
mod config;
mod drain_listener;
mod relay;
mod report;
mod source;


use relay::{InitError, Relay};
use source::AmqpSource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Unrecoverable failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("REPORT_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid REPORT_RELAY_LOG_LEVEL: {val:?}, defaulting to INFO");
                None
            })
        })
        .unwrap_or(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

/// lapin's TLS transport needs a process-wide provider for `amqps://` URLs.
fn setup_rustls() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() {
    // Before logging, so REPORT_RELAY_LOG_LEVEL can come from the file too.
    let dotenv = config::load_dotenv();
    setup_logging();
    setup_rustls();

    match dotenv {
        Ok(Some(path)) => debug!(path = %path.display(), "loaded .env file"),
        Ok(None) => debug!("no .env file found"),
        Err(e) => fatal("failed to load configuration", &InitError::from(e)),
    }

    let config = config::Config::from_env()
        .unwrap_or_else(|e| fatal("failed to load configuration", &InitError::from(e)));

    // The URL carries credentials; only the host is logged.
    info!(
        host = config.amqp_url.host_str().unwrap_or_default(),
        queue = %config.queue,
        "connecting to message broker"
    );
    let source = AmqpSource::connect(config.amqp_url.as_str(), &config.queue)
        .await
        .unwrap_or_else(|e| fatal("failed to start consumer", &InitError::from(e)));

    let cancel = CancellationToken::new();
    let mut relay = Relay::new(source, &config, cancel.clone())
        .await
        .unwrap_or_else(|e| fatal("failed to start drain listener", &e));
    info!(
        addr = %relay.local_addr(),
        path = drain_listener::REPORTS_PATH,
        "drain listener ready"
    );

    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("shutdown signal received");
                cancel.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signals"),
        }
    });

    if let Err(e) = relay.run().await {
        fatal("relay stopped", &e);
    }
}
