//! Public client surface.
//!
//! [`RealtimeClient`] spawns the engine task and hands out cheap cloneable
//! handles ([`Connection`], [`Channel`], [`ChannelPresence`], [`Auth`]) that
//! marshal commands into it. Every handle method is safe to call from any
//! task; replies come back on oneshot channels.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::auth::{AuthMechanism, TokenDetails, TokenParams};
use crate::channel::{ChannelState, ChannelStateChange};
use crate::config::ClientOptions;
use crate::connection::{Command, ConnectionState, ConnectionStateChange, Engine};
use crate::error::{Error, ErrorInfo, error_code};
use crate::protocol::{Message, PresenceAction, PresenceMessage};

fn engine_gone() -> ErrorInfo {
    ErrorInfo::new(error_code::CLOSED, "client has been shut down")
}

/// Entry point: owns the engine task for its lifetime. Dropping the last
/// clone of the client (and its handles) shuts the engine down.
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl RealtimeClient {
    /// Build the client and spawn its engine. With `auto_connect` (the
    /// default) the connection attempt starts immediately.
    pub fn new(opts: ClientOptions) -> Result<Self, Error> {
        let auto_connect = opts.auto_connect;
        let (engine, commands) = Engine::new(opts)?;
        tokio::spawn(engine.run());
        if auto_connect {
            let _ = commands.send(Command::Connect);
        }
        Ok(RealtimeClient { commands })
    }

    pub fn connection(&self) -> Connection {
        Connection {
            commands: self.commands.clone(),
        }
    }

    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel {
            name: name.into(),
            commands: self.commands.clone(),
        }
    }

    /// Drop the engine's state for a channel (subscriptions, presence map,
    /// retained errors). The channel must be detached, failed, or never
    /// attached; releasing an active channel is rejected.
    pub async fn release(&self, name: impl Into<String>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Release {
                channel: name.into(),
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    pub fn auth(&self) -> Auth {
        Auth {
            commands: self.commands.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Begin (or resume) connecting. Idempotent while already connecting or
    /// connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close gracefully: a CLOSE handshake when connected, immediate
    /// otherwise.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ConnectionState(tx)).is_err() {
            return ConnectionState::Closed;
        }
        rx.await.unwrap_or(ConnectionState::Closed)
    }

    /// The server-assigned connection id, once CONNECTED.
    pub async fn id(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ConnectionId(tx)).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// The last error the connection state machine retained.
    pub async fn error_reason(&self) -> Option<ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ConnectionError(tx)).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Listen for connection state transitions, in occurrence order.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<ConnectionStateChange>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeConnection(tx))
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    /// Wait for the next connection state transition, whatever it is.
    pub async fn once(&self) -> Result<ConnectionStateChange, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::OnceConnection(tx))
            .map_err(|_| engine_gone())?;
        let event = rx.await.map_err(|_| engine_gone())?;
        event.await.map_err(|_| engine_gone())
    }

    /// Round-trip a heartbeat, resolving with the elapsed time.
    pub async fn ping(&self) -> Result<Duration, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Ping(tx))
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }
}

// ---------------------------------------------------------------------------
// Channel handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Channel {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach, resolving once the server confirms (or the attempt fails).
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Attach {
                channel: self.name.clone(),
                completion: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Detach {
                channel: self.name.clone(),
                completion: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    pub async fn state(&self) -> ChannelState {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ChannelState {
                channel: self.name.clone(),
                reply: tx,
            })
            .is_err()
        {
            return ChannelState::Detached;
        }
        rx.await.unwrap_or(ChannelState::Detached)
    }

    pub async fn subscribe_states(&self) -> Result<mpsc::Receiver<ChannelStateChange>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeChannelState {
                channel: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    /// Wait for the next channel state transition, whatever it is.
    pub async fn once(&self) -> Result<ChannelStateChange, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::OnceChannelState {
                channel: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        let event = rx.await.map_err(|_| engine_gone())?;
        event.await.map_err(|_| engine_gone())
    }

    /// Receive every message published to the channel.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<Message>, ErrorInfo> {
        self.subscribe_filtered(None).await
    }

    /// Receive only messages whose name matches.
    pub async fn subscribe_named(
        &self,
        name: impl Into<String>,
    ) -> Result<mpsc::Receiver<Message>, ErrorInfo> {
        self.subscribe_filtered(Some(name.into())).await
    }

    async fn subscribe_filtered(
        &self,
        name: Option<String>,
    ) -> Result<mpsc::Receiver<Message>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeMessages {
                channel: self.name.clone(),
                name,
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    /// Publish one named message, resolving on server acknowledgement.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ErrorInfo> {
        self.publish_messages(vec![Message {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }])
        .await
    }

    /// Publish a batch atomically (one protocol message, one acknowledgement).
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                channel: self.name.clone(),
                messages,
                completion: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    pub fn presence(&self) -> ChannelPresence {
        ChannelPresence {
            channel: self.name.clone(),
            commands: self.commands.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChannelPresence {
    channel: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelPresence {
    /// Enter the presence set as the client's configured identity.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.op(PresenceAction::Enter, None, data).await
    }

    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.op(PresenceAction::Update, None, data).await
    }

    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.op(PresenceAction::Leave, None, data).await
    }

    /// Enter on behalf of another client id (wildcard-capable tokens).
    pub async fn enter_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        self.op(PresenceAction::Enter, Some(client_id.into()), data)
            .await
    }

    pub async fn leave_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        self.op(PresenceAction::Leave, Some(client_id.into()), data)
            .await
    }

    async fn op(
        &self,
        presence_action: PresenceAction,
        client_id: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PresenceOp {
                channel: self.channel.clone(),
                presence_action,
                client_id,
                data,
                completion: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// A consistent snapshot of the members. Waits out an in-flight SYNC so
    /// the answer is never a half-applied page.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PresenceGet {
                channel: self.channel.clone(),
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// Receive presence events (ENTER/UPDATE/LEAVE, plus synthesized LEAVEs)
    /// as the map applies them.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<PresenceMessage>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribePresence {
                channel: self.channel.clone(),
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }
}

// ---------------------------------------------------------------------------
// Auth handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Auth {
    commands: mpsc::UnboundedSender<Command>,
}

impl Auth {
    /// Force a credential renewal. While connected, the fresh token is also
    /// presented to the server in place.
    pub async fn authorize(
        &self,
        params: Option<TokenParams>,
    ) -> Result<TokenDetails, ErrorInfo> {
        self.authorize_with(None, params).await
    }

    /// Renew with a replacement mechanism (e.g. a new callback or URL).
    pub async fn authorize_with(
        &self,
        mechanism: Option<AuthMechanism>,
        params: Option<TokenParams>,
    ) -> Result<TokenDetails, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Authorize {
                mechanism,
                params,
                reply: tx,
            })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// Fetch the server clock and cache the offset for future token request
    /// timestamps.
    pub async fn server_time(&self) -> Result<i64, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ServerTime(tx))
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// Forget the cached clock offset, e.g. after a detected system clock
    /// change. The next `server_time` call fetches it afresh.
    pub fn discard_time_offset(&self) {
        let _ = self.commands.send(Command::DiscardTimeOffset);
    }
}
