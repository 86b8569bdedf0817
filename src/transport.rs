//! Duplex envelope transports.
//!
//! The production transport is a websocket; tests run the same channel and
//! queue code over an in-memory pair.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::protocol::{ChannelError, Envelope};

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Next inbound envelope; `None` means the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Envelope>, ChannelError>;
}

pub struct WebsocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebsocketTransport {
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        debug!(%url, "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        let body = serde_json::to_string(&envelope)?;
        self.stream
            .send(WsMessage::Text(body.into()))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, ChannelError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(ChannelError::Transport(err.to_string())),
                None => return Ok(None),
            };
            match message {
                WsMessage::Text(text) => match serde_json::from_str(&text) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(err) => {
                        warn!(%err, "dropping unparseable frame");
                    }
                },
                WsMessage::Ping(data) => {
                    let _ = self.stream.send(WsMessage::Pong(data)).await;
                }
                WsMessage::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }
}

/// One end of an in-memory transport pair.
pub struct MemoryTransport {
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
}

impl MemoryTransport {
    /// A connected pair; envelopes sent on one end arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::channel(128);
        let (right_tx, right_rx) = mpsc::channel(128);
        (
            Self {
                tx: left_tx,
                rx: right_rx,
            },
            Self {
                tx: right_tx,
                rx: left_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx.send(envelope).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, ChannelError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_pair_round_trips_envelopes() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(Envelope {
            topic: "worker:queue".to_string(),
            event: "claim".to_string(),
            reference: Some(1),
            payload: json!({"demand": 1}),
        })
        .await
        .expect("send");
        let received = b.recv().await.expect("recv").expect("open");
        assert_eq!(received.event, "claim");
        assert_eq!(received.payload, json!({"demand": 1}));
    }
}
