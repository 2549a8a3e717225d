//! Reader tasks for the host's standard streams.
//!
//! Each task drives a [`FramedRead`] over one stream with [`WireCodec`],
//! turns every frame into an [`OutputRecord`] and hands it to the
//! [`Router`]. Undecodable lines become records carrying their decode error;
//! they never stop the loop.
//!
//! The stdout reader is the protocol channel: when it reaches EOF or fails,
//! every outstanding waiter is resolved with
//! [`AppError::ProcessTerminated`]. The stderr reader only feeds diagnostics
//! into the unsolicited queue.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::router::Router;
use crate::protocol::codec::WireCodec;
use crate::protocol::envelope::StreamSource;
use crate::AppError;

/// Read `stream` line by line until EOF, an I/O error or cancellation.
///
/// For [`StreamSource::Stdout`] the end of the stream (but not cancellation)
/// terminates the router with `"stream closed"` or `"stream error: …"`.
pub async fn run_reader<R>(
    source: StreamSource,
    stream: R,
    router: Arc<Router>,
    max_line_bytes: Option<usize>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, WireCodec::from_limit(max_line_bytes));

    let end_reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%source, "reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(%source, "reader: EOF detected");
                        break "stream closed".to_owned();
                    }

                    Some(Err(e)) => {
                        warn!(%source, error = %e, "reader: IO error, stopping");
                        break format!("stream error: {e}");
                    }

                    Some(Ok(frame)) => {
                        if frame.is_blank() {
                            continue;
                        }
                        let record = frame.into_record(source);
                        trace!(%source, raw = %record.raw, "reader: line received");
                        router.route(record);
                    }
                }
            }
        }
    };

    if source == StreamSource::Stdout {
        router.terminate_all(AppError::ProcessTerminated(end_reason));
    }
}
