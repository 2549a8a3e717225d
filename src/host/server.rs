//! Host serve loop over a pair of byte streams.
//!
//! Announces readiness, then reads one request per line and handles each in
//! its own task so a long invocation never blocks other requests. Lines that
//! fail to decode are answered with an error record and reading continues.
//! The loop ends on end of input or after `shutdown` is acknowledged; in
//! both cases in-flight requests are drained before returning.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::host::dispatch::Host;
use crate::host::sink::HostWriter;
use crate::protocol::codec::WireCodec;
use crate::protocol::envelope::{DecodeError, Envelope, ErrorCode, ErrorObject, Response};
use crate::Result;

/// Serve `host` until input ends or shutdown is requested.
///
/// # Errors
///
/// Returns [`crate::AppError::Transport`] if the ready announcement cannot be
/// written. Read failures after that end the loop without an error.
pub async fn serve<R, W>(host: Arc<Host>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(HostWriter::new(output));
    writer.send(host.ready_response()?).await?;
    info!(name = host.name(), "host ready");

    let shutdown = host.shutdown_token();
    let mut frames = FramedRead::new(input, WireCodec::new());
    let mut tasks = JoinSet::new();

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("shutdown requested; no longer reading input");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    warn!(%err, "request task failed");
                }
                continue;
            }
            next = frames.next() => next,
        };

        let frame = match next {
            None => {
                info!("input closed");
                break;
            }
            Some(Err(err)) => {
                warn!(%err, "input read failed");
                break;
            }
            Some(Ok(frame)) if frame.is_blank() => continue,
            Some(Ok(frame)) => frame,
        };

        match frame.decode() {
            (_, Ok(Envelope::Request(request))) => {
                debug!(request_id = %request.id, method = %request.method, "request received");
                let host = Arc::clone(&host);
                let writer = Arc::clone(&writer);
                tasks.spawn(async move { host.handle(request, &writer).await });
            }
            (_, Ok(Envelope::Response(resp))) => {
                warn!(id = %resp.id, "record without method");
                let error = ErrorObject::new(ErrorCode::InvalidRequest, "missing required field: method");
                reply_error(&writer, Response::error(resp.id, error)).await;
            }
            (raw, Err(err)) => {
                warn!(kind = ?err.kind, "undecodable line");
                reply_error(&writer, decode_error_response(&raw, &err)).await;
            }
        }
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        info!(in_flight, "draining in-flight requests");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(%err, "request task failed");
        }
    }
    info!("host stopped");
    Ok(())
}

async fn reply_error(writer: &HostWriter, response: Response) {
    if let Err(err) = writer.send(response).await {
        warn!(%err, "failed to write error record");
    }
}

/// Error record for an undecodable line, tagged with its `id` when one can
/// still be read from the text.
fn decode_error_response(raw: &str, err: &DecodeError) -> Response {
    let id = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("id").and_then(|id| id.as_str()).map(str::to_owned))
        .unwrap_or_default();
    let error = ErrorObject::new(err.error_code(), err.message.clone()).with_details(raw);
    Response::error(id, error)
}
