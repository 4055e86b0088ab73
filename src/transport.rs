use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};

use crate::errors::StreamError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One open, text-oriented duplex connection to an exchange.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), StreamError>;

    /// Next text frame, `Ok(None)` once the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<String>, StreamError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, StreamError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, StreamError> {
        let (stream, _response) = connect_async(url).await?;
        tracing::info!(ws_endpoint = %url, "connected upstream websocket");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        self.stream
            .send(TungsteniteMessage::Text(text.into()))
            .await
            .map_err(StreamError::from)
    }

    async fn next_frame(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            match self.stream.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    return Ok(Some(text.as_str().to_owned()));
                }
                Some(Ok(TungsteniteMessage::Binary(binary))) => {
                    match String::from_utf8(binary.to_vec()) {
                        Ok(text) => return Ok(Some(text)),
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping non-UTF-8 binary frame");
                        }
                    }
                }
                Some(Ok(TungsteniteMessage::Close(_))) | None => return Ok(None),
                // tungstenite queues the pong for a ping itself and flushes it
                // on the next read or write.
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
