//! Transport seam between the pumps and a concrete WebSocket.
//!
//! The pumps only see [`Frame`]s through [`FrameStream`] and [`FrameSink`].
//! Anything that is a `Stream` of frames or a `Sink` of frames qualifies, so
//! the axum socket and the in-memory test transport plug in the same way.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;

use crate::hub::Payload;

/// One WebSocket frame, independent of the WebSocket library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(Payload),
    /// Binary message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Close control frame with its status code, if any.
    Close(Option<u16>),
}

impl Frame {
    /// Text frame from anything convertible into a shared payload.
    pub fn text(payload: impl Into<Payload>) -> Self {
        Self::Text(payload.into())
    }
}

/// Errors surfaced by a transport half.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The other side is gone.
    #[error("transport closed")]
    Closed,
    /// A single read or write missed its deadline.
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),
    /// The peer dropped the connection without a close handshake.
    #[error("connection reset without closing handshake")]
    Reset,
    /// Protocol or I/O failure reported by the WebSocket library.
    #[error("transport error: {0}")]
    Io(String),
}

/// Read half: yields frames until the peer goes away.
pub trait FrameStream: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static {}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static
{
}

/// Write half: accepts frames; `close` shuts the transport down.
pub trait FrameSink: Sink<Frame, Error = TransportError> + Send + Unpin + 'static {}

impl<T> FrameSink for T where T: Sink<Frame, Error = TransportError> + Send + Unpin + 'static {}

/// Split an upgraded axum socket into the two transport halves.
pub fn split_axum(socket: WebSocket) -> (impl FrameStream, impl FrameSink) {
    let (sink, stream) = socket.split();
    let stream = stream.map(|read| read.map(Frame::from).map_err(|e| classify_error(&e)));
    let sink = sink
        .sink_map_err(|e| classify_error(&e))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
    (stream, sink)
}

/// Map a WebSocket library error onto a [`TransportError`].
///
/// Walks the source chain so an abrupt disconnect is recognised whether the
/// library reports it as its own protocol error or as a wrapped I/O error.
pub fn classify_error(error: &(dyn std::error::Error + 'static)) -> TransportError {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return TransportError::Reset;
            }
        }
        if err.to_string().contains("without closing handshake") {
            return TransportError::Reset;
        }
        current = err.source();
    }
    TransportError::Io(error.to_string())
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Self::Text(Arc::from(text.as_str())),
            Message::Binary(data) => Self::Binary(data),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(frame) => Self::Close(frame.map(|f| f.code)),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(payload) => Self::Text(Utf8Bytes::from(&*payload)),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close(code) => Self::Close(code.map(|code| CloseFrame {
                code,
                reason: Utf8Bytes::from(""),
            })),
        }
    }
}
