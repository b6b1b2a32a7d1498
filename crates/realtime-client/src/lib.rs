//! Realtime pub/sub client over a persistent bidirectional connection.
//!
//! Implements the realtime protocol client side: a resumable WebSocket
//! connection speaking MessagePack protocol messages, per-channel attach
//! lifecycles, presence membership with SYNC reconciliation, and token-based
//! authentication with proactive renewal.
//!
//! A single engine task owns all mutable state (connection and channel state
//! machines, presence maps, the auth coordinator); the public handles are
//! cheap clones that marshal commands into it, so there are no locks and
//! every observer sees transitions in the order they occurred.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use realtime_client::{AuthMechanism, ClientOptions, RealtimeClient};
//!
//! let opts = ClientOptions::new(AuthMechanism::from_key("app.key:secret")?);
//! let client = RealtimeClient::new(opts)?;
//!
//! let channel = client.channel("room:lobby");
//! let mut messages = channel.subscribe().await?;
//! channel.attach().await?;
//! channel.publish("greeting", serde_json::json!("hello")).await?;
//!
//! while let Some(msg) = messages.recv().await {
//!     println!("got: {:?}", msg.name);
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod client;
mod config;
mod connection;
mod error;
mod events;
mod http;
mod presence;
mod protocol;
mod transport;

pub use auth::{
    AuthCallback, AuthMechanism, TokenDetails, TokenParams, TokenRequest, TokenSource,
    TokenSourceFuture, sign_token_request,
};
pub use channel::{ChannelState, ChannelStateChange};
pub use client::{Auth, Channel, ChannelPresence, Connection, RealtimeClient};
pub use config::{ClientOptions, TimingConfig};
pub use connection::{ConnectionState, ConnectionStateChange};
pub use error::{BoxError, Error, ErrorInfo, error_code};
pub use http::{HttpExecutor, HttpMethod, HttpRequest, HttpResponse, ReqwestExecutor};
pub use protocol::{
    AuthDetails, ConnectionDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage,
    action, decode_msg, encode_msg, flags,
};
pub use transport::{Transport, TransportFactory, TransportParams, WebSocketFactory};
