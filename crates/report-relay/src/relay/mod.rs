use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::ReportBuffer;
use crate::config::{Config, ConfigError};
use crate::drain_listener;
use crate::report;
use crate::source::{MessageSource, SourceError};

/// Startup failures. All of them end the process.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("message source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("failed to bind drain listener on {addr}: {source}")]
    ListenerBind { addr: SocketAddr, source: io::Error },
}

/// Failures after startup that stop the relay.
#[derive(Debug, Error)]
pub enum ExitError {
    #[error("message source failed: {0}")]
    Source(#[from] SourceError),

    #[error("message source closed unexpectedly")]
    SourceClosed,

    #[error("drain listener died unexpectedly")]
    ListenerDied,
}

/// Owns the consume loop and the drain listener task.
///
/// The consumer side is driven by `run()`; drains are served concurrently by
/// the listener task. Both touch only the shared `ReportBuffer`.
pub struct Relay<S: MessageSource> {
    source: S,
    buffer: ReportBuffer,
    cancel: CancellationToken,
    listener_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl<S: MessageSource> Relay<S> {
    /// Bind the drain listener and start serving. Cancelling `cancel` stops
    /// the listener and makes `run()` return `Ok`.
    pub async fn new(
        source: S,
        config: &Config,
        cancel: CancellationToken,
    ) -> Result<Self, InitError> {
        let addr = SocketAddr::new(config.bind_address, config.listener_port);
        let bind_err = |source: io::Error| InitError::ListenerBind { addr, source };

        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let buffer = ReportBuffer::new(config.buffer_max_reports);
        let listener_task = tokio::spawn(drain_listener::serve(
            listener,
            buffer.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            source,
            buffer,
            cancel,
            listener_task,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Consume until shutdown is requested or something fails.
    pub async fn run(&mut self) -> Result<(), ExitError> {
        loop {
            match self.tick().await {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(()) => {}
            }
        }
    }

    /// Wait for whichever happens first: a payload, a shutdown request, or
    /// the listener task exiting.
    async fn tick(&mut self) -> ControlFlow<Result<(), ExitError>> {
        tokio::select! {
            next = self.source.next_payload() => {
                match next {
                    Some(Ok(payload)) => self.ingest(&payload),
                    Some(Err(e)) => {
                        self.log_stopped();
                        return ControlFlow::Break(Err(ExitError::Source(e)));
                    }
                    None if !self.cancel.is_cancelled() => {
                        self.log_stopped();
                        return ControlFlow::Break(Err(ExitError::SourceClosed));
                    }
                    None => {}
                }
            }
            _ = self.cancel.cancelled() => {
                debug!("shutdown requested");
                // The accept loop exits as soon as it sees the cancellation.
                if let Err(e) = (&mut self.listener_task).await {
                    error!(error = %e, "drain listener task failed");
                }
                self.log_stopped();
                return ControlFlow::Break(Ok(()));
            }
            result = &mut self.listener_task => {
                if let Err(e) = result {
                    error!(error = %e, "drain listener task failed");
                }
                if self.cancel.is_cancelled() {
                    self.log_stopped();
                    return ControlFlow::Break(Ok(()));
                }
                return ControlFlow::Break(Err(ExitError::ListenerDied));
            }
        }
        ControlFlow::Continue(())
    }

    // Nothing is persisted, so whatever is still buffered is lost on exit.
    fn log_stopped(&self) {
        if self.buffer.is_empty() {
            info!("relay stopped");
        } else {
            warn!(
                discarded = self.buffer.len(),
                "relay stopped with undrained reports"
            );
        }
    }

    /// Decode one payload and buffer it. A bad payload is logged and dropped;
    /// it was already acknowledged, so it is gone for good.
    fn ingest(&self, payload: &[u8]) {
        match report::decode(payload) {
            Ok(report) => {
                debug!(?report, "report received");
                self.buffer.append(report);
            }
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "dropping undecodable message");
            }
        }
    }
}
