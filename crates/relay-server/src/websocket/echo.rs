//! Plain echo endpoint: every text or binary message goes straight back to
//! the peer that sent it. No hub, no world.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tracing::{debug, trace};

use super::transport::{Frame, FrameSink, FrameStream, TransportError};

/// Echo frames until the peer closes or a read/write fails.
///
/// Returns how many messages were echoed.
pub async fn run_echo<S, K>(mut stream: S, mut sink: K, write_wait: Duration) -> usize
where
    S: FrameStream,
    K: FrameSink,
{
    let mut echoed = 0;
    while let Some(read) = stream.next().await {
        let frame = match read {
            Ok(frame @ (Frame::Text(_) | Frame::Binary(_))) => frame,
            Ok(Frame::Close(_)) => break,
            Ok(Frame::Ping(_) | Frame::Pong(_)) => continue,
            Err(e) => {
                debug!(error = %e, "echo read failed");
                break;
            }
        };
        let sent = match tokio::time::timeout(write_wait, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(write_wait)),
        };
        if let Err(e) = sent {
            debug!(error = %e, "echo write failed");
            break;
        }
        echoed += 1;
        trace!(echoed, "echo");
    }
    let _ = tokio::time::timeout(write_wait, sink.close()).await;
    echoed
}
