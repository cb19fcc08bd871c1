use std::convert::Infallible;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::ReportBuffer;

pub const REPORTS_PATH: &str = "/reports";

/// Pause after a failed accept. Errors such as EMFILE persist until a
/// connection closes, so retrying at once would spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

fn response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp
}

/// Drain the buffer and answer with the reports as a JSON array.
/// Any method is accepted; the request body is never read.
async fn handle<B>(
    req: Request<B>,
    buffer: ReportBuffer,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    if path != REPORTS_PATH {
        warn!(path, method = %req.method(), "drain request rejected");
        return Ok(response(StatusCode::NOT_FOUND, Bytes::new()));
    }

    let reports = buffer.drain_all();
    let body = match serde_json::to_vec(&reports) {
        Ok(body) => body,
        // Unreachable for string-keyed maps of JSON values.
        Err(e) => {
            error!(error = %e, dropped = reports.len(), "failed to serialize drained reports");
            return Ok(response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()));
        }
    };
    debug!(count = reports.len(), "drained reports");

    let mut resp = response(StatusCode::OK, Bytes::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(resp)
}

/// Serve drain requests until `cancel` fires. Each connection gets its own
/// task; a drain only ever waits on the buffer lock.
pub async fn serve(listener: TcpListener, buffer: ReportBuffer, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        accept_backoff(&e).await;
                        continue;
                    }
                };
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, buffer.clone()));
                    if let Err(e) = Builder::new(hyper_util::rt::TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "drain connection closed with error");
                    }
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}

async fn accept_backoff(error: &io::Error) {
    warn!(error = %error, "failed to accept connection");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}
