//! WebSocket transport over `tokio-tungstenite`.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::{
    traits::{Link, Transport},
    types::{Payload, TransportError},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] that opens plain WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    type Link = WsLink;

    async fn open(&self, endpoint: &Url) -> Result<WsLink, TransportError> {
        let (stream, response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(endpoint = %endpoint, status = %response.status(), "websocket handshake complete");
        Ok(WsLink { stream, closed: false })
    }
}

/// An open WebSocket stream.
pub struct WsLink {
    stream: WsStream,
    closed: bool,
}

impl std::fmt::Debug for WsLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsLink").field("closed", &self.closed).finish_non_exhaustive()
    }
}

impl Link for WsLink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_payload(&mut self) -> Result<Option<Payload>, TransportError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                self.closed = true;
                return Ok(None);
            };
            match frame.map_err(|e| TransportError::Receive(e.to_string()))? {
                Message::Text(text) => return Ok(Some(Payload::Text(text.as_str().to_owned()))),
                Message::Binary(bytes) => return Ok(Some(Payload::Binary(bytes.to_vec()))),
                Message::Close(frame) => {
                    debug!(?frame, "close frame received");
                    self.closed = true;
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}
