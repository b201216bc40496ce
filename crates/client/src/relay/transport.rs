// Transport seam for the relay: the connection manager only sees frames.
//
// `WsTransport` is the production implementation over tokio-tungstenite;
// tests substitute an in-memory transport.

use std::future::Future;

use anyhow::{anyhow, Context, Result};
use checkin_common::protocol::events::{DecodeError, InboundEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// A data frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn decode(&self) -> Result<InboundEvent, DecodeError> {
        match self {
            Self::Text(text) => InboundEvent::decode(text),
            Self::Binary(bytes) => InboundEvent::decode_bytes(bytes),
        }
    }
}

/// Opens connections to the event stream.
pub trait RelayTransport: Send + Sync + 'static {
    type Connection: RelayConnection;

    fn open(&self, url: &Url) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// One open connection.
pub trait RelayConnection: Send + 'static {
    /// Next data frame. `Some(Err(_))` reports a transport error; `None`
    /// means the connection is closed.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame>>> + Send;

    /// Close from the client side.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ── WebSocket transport ─────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

pub struct WsConnection {
    stream: WsStream,
    finished: bool,
}

impl RelayTransport for WsTransport {
    type Connection = WsConnection;

    async fn open(&self, url: &Url) -> Result<WsConnection> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to open websocket `{url}`"))?;
        debug!(ws_url = %url, status = %response.status(), "websocket handshake complete");
        Ok(WsConnection { stream, finished: false })
    }
}

impl RelayConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.finished {
            return None;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Some(Ok(Message::Binary(payload))) => return Some(Ok(Frame::Binary(payload.to_vec()))),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(error) = self.stream.send(Message::Pong(payload)).await {
                        debug!(%error, "failed to answer websocket ping");
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by server");
                    self.finished = true;
                    return None;
                }
                Some(Err(error)) => {
                    self.finished = true;
                    return Some(Err(anyhow!(error).context("websocket read failed")));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(error) = self.stream.close(None).await {
            debug!(%error, "websocket close handshake failed");
        }
    }
}
