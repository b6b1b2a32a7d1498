//! Transport seam and the production WebSocket implementation.
//!
//! The engine knows nothing about sockets or TLS beyond this surface: it asks
//! a [`TransportFactory`] to connect, then exchanges [`ProtocolMessage`]s.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::Error;
use crate::protocol::{Codec, MsgpackCodec, ProtocolMessage};

pub(crate) const PROTOCOL_VERSION: &str = "5";
const AGENT_STRING: &str = "realtime-client-rs/0.1";

/// Parameters for opening one transport.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub token: String,
    /// Prior connection key, set when attempting a resume.
    pub resume_key: Option<String>,
    /// Whether messages published on this connection are echoed back.
    pub echo: bool,
    pub client_id: Option<String>,
}

/// One open transport. `recv` returning `None` means the peer closed.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error>;
    async fn recv(&mut self) -> Option<Result<ProtocolMessage, Error>>;
    async fn close(&mut self);
}

/// Opens transports. The engine owns exactly one live transport at a time.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, params: TransportParams) -> Result<Box<dyn Transport>, Error>;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

pub struct WebSocketTransport {
    write: WsWrite,
    read: WsRead,
    codec: Arc<dyn Codec>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error> {
        let data = self.codec.encode(msg)?;
        self.write
            .send(tungstenite::Message::Binary(data.into()))
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ProtocolMessage, Error>> {
        while let Some(frame) = self.read.next().await {
            match frame {
                Ok(tungstenite::Message::Binary(data)) => match self.codec.decode(&data) {
                    Ok(msg) => return Some(Ok(msg)),
                    Err(e) => {
                        // A single undecodable frame is skipped, not fatal.
                        tracing::warn!("failed to decode frame: {e}");
                    }
                },
                Ok(tungstenite::Message::Close(_)) => return None,
                Ok(_) => {
                    // Ignore text, ping, pong frames
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.write.send(tungstenite::Message::Close(None)).await;
    }
}

/// Factory for TLS WebSocket transports speaking the MessagePack codec.
pub struct WebSocketFactory {
    /// `wss` in production; tests against a plain listener use `ws`.
    pub secure: bool,
}

impl Default for WebSocketFactory {
    fn default() -> Self {
        WebSocketFactory { secure: true }
    }
}

impl WebSocketFactory {
    fn build_url(&self, params: &TransportParams) -> Result<String, Error> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut u = url::Url::parse(&format!("{scheme}://{}/", params.host))?;
        {
            let mut q = u.query_pairs_mut();
            q.append_pair("access_token", &params.token);
            q.append_pair("format", "msgpack");
            q.append_pair("v", PROTOCOL_VERSION);
            q.append_pair("agent", AGENT_STRING);
            q.append_pair("heartbeats", "true");
            q.append_pair("echo", if params.echo { "true" } else { "false" });
            if let Some(client_id) = &params.client_id {
                q.append_pair("clientId", client_id);
            }
            if let Some(key) = &params.resume_key {
                q.append_pair("resume", key);
            }
        }
        Ok(u.to_string())
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn connect(&self, params: TransportParams) -> Result<Box<dyn Transport>, Error> {
        let url = self.build_url(&params)?;
        let (ws, _resp) = tokio_tungstenite::connect_async(&url).await?;
        let (write, read) = ws.split();
        Ok(Box::new(WebSocketTransport {
            write,
            read,
            codec: Arc::new(MsgpackCodec),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(resume: Option<&str>) -> TransportParams {
        TransportParams {
            host: "realtime.ably.io".to_string(),
            token: "my-token".to_string(),
            resume_key: resume.map(|s| s.to_string()),
            echo: false,
            client_id: None,
        }
    }

    #[test]
    fn build_url_basic() {
        let factory = WebSocketFactory::default();
        let url = factory.build_url(&params(None)).unwrap();
        assert!(url.starts_with("wss://realtime.ably.io/"));
        assert!(url.contains("access_token=my-token"));
        assert!(url.contains("format=msgpack"));
        assert!(url.contains("v=5"));
        assert!(url.contains("heartbeats=true"));
        assert!(url.contains("echo=false"));
        assert!(!url.contains("resume="));
    }

    #[test]
    fn build_url_with_resume() {
        let factory = WebSocketFactory::default();
        let url = factory.build_url(&params(Some("conn-key!abc"))).unwrap();
        assert!(url.contains("resume=conn-key"));
    }

    #[test]
    fn build_url_insecure_for_tests() {
        let factory = WebSocketFactory { secure: false };
        let url = factory.build_url(&params(None)).unwrap();
        assert!(url.starts_with("ws://realtime.ably.io/"));
    }

    #[test]
    fn build_url_echo_and_client_id() {
        let factory = WebSocketFactory::default();
        let mut p = params(None);
        p.echo = true;
        p.client_id = Some("alice".to_string());
        let url = factory.build_url(&p).unwrap();
        assert!(url.contains("echo=true"));
        assert!(url.contains("clientId=alice"));
    }
}
