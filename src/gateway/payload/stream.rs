use std::task::Poll;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use snafu::prelude::*;
use tokio_tungstenite::tungstenite as websocket;

use super::{DecodeError, GatewayPayload};

/// The underlying websocket connection type used in production.
pub type WsConnection =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Error when read/write the payload stream/sink
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum PayloadStreamError {
    /// underlying websocket stream broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        source: websocket::Error,
    },

    /// remote closed the connection with a close frame
    #[snafu(display("websocket closed by remote, code {code}"))]
    Closed {
        /// close code from the frame, 1005 when absent
        code: u16,
    },

    /// received a frame type that cannot carry a payload
    #[snafu(display("received a non-payload frame type"))]
    UnexpectedFrame,

    /// parse frame data as a payload failed
    #[snafu(display("parse frame to payload failed: {source}"))]
    ParsePayloadFailed {
        /// source error
        source: DecodeError,
    },
}

impl PayloadStreamError {
    /// Check if this error will make the stream/sink stop
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Websocket { .. } | Self::Closed { .. } => true,
            Self::UnexpectedFrame | Self::ParsePayloadFailed { .. } => false,
        }
    }
}

/// Gateway payload stream/sink over a websocket connection.
///
/// Inbound text frames are parsed directly; inbound binary frames are
/// inflated first when `compress` is set. Outbound payloads are always
/// sent as JSON text frames.
#[derive(Debug)]
pub struct PayloadStreamSink {
    ws: WsConnection,
    compress: bool,
}

impl PayloadStreamSink {
    /// Wrap a websocket connection.
    pub fn new(ws: WsConnection, compress: bool) -> Self {
        Self { ws, compress }
    }
}

impl Stream for PayloadStreamSink {
    type Item = Result<GatewayPayload, PayloadStreamError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            let frame = match self.ws.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(websocket::Error::ConnectionClosed))) => {
                    return Poll::Ready(None)
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(PayloadStreamError::Websocket { source: e })))
                }
                Poll::Ready(Some(Ok(frame))) => frame,
            };

            let result = match frame {
                websocket::Message::Text(text) => {
                    let buffer: Bytes = text.into_bytes().into();
                    GatewayPayload::decode(buffer, false).context(error::ParsePayloadFailed)
                }
                websocket::Message::Binary(data) => {
                    let buffer: Bytes = data.into();
                    let compress = self.compress;
                    GatewayPayload::decode(buffer, compress).context(error::ParsePayloadFailed)
                }
                websocket::Message::Close(frame) => {
                    let code = frame.map_or(1005, |f| u16::from(f.code));
                    error::Closed { code }.fail()
                }
                // tungstenite answers pings internally
                websocket::Message::Ping(_) | websocket::Message::Pong(_) => continue,
                websocket::Message::Frame(_) => error::UnexpectedFrame.fail(),
            };

            return Poll::Ready(Some(result));
        }
    }
}

impl Sink<GatewayPayload> for PayloadStreamSink {
    type Error = PayloadStreamError;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_ready_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: GatewayPayload,
    ) -> Result<(), Self::Error> {
        self.ws
            .start_send_unpin(websocket::Message::Text(item.encode()))
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_flush_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_close_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }
}
