//! The connection engine: a single task owning the connection state machine,
//! the channel registry, presence maps, and the auth coordinator.
//!
//! Public handles marshal commands into the engine over an unbounded mpsc;
//! replies travel back on oneshot channels. Network work that must not block
//! the loop (transport connects, token fetches, server time) runs in spawned
//! tasks that report back through the internal channel, each tagged with a
//! generation counter so a superseded result is discarded rather than applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::{AuthCoordinator, AuthMechanism, TokenDetails, TokenParams, fetch_server_time, fetch_token, now_ms};
use crate::channel::{ChannelCore, ChannelState, ChannelStateChange, Completion, Outbound};
use crate::config::{ClientOptions, TimingConfig};
use crate::error::{Error, ErrorInfo, error_code};
use crate::events::Emitter;
use crate::http::{HttpExecutor, ReqwestExecutor};
use crate::protocol::{
    AuthDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage, action,
};
use crate::transport::{Transport, TransportFactory, TransportParams, WebSocketFactory};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// States from which a connection attempt will (eventually) be made and
    /// outbound operations may be queued.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Delivered to connection state listeners on every transition.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// How long until the next automatic retry, when one is scheduled.
    pub retry_in: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Engine commands
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Connect,
    Close,
    ConnectionState(oneshot::Sender<ConnectionState>),
    ConnectionId(oneshot::Sender<Option<String>>),
    ConnectionError(oneshot::Sender<Option<ErrorInfo>>),
    SubscribeConnection(oneshot::Sender<mpsc::Receiver<ConnectionStateChange>>),
    OnceConnection(oneshot::Sender<oneshot::Receiver<ConnectionStateChange>>),
    Ping(oneshot::Sender<Result<Duration, ErrorInfo>>),
    Attach {
        channel: String,
        completion: Completion,
    },
    Detach {
        channel: String,
        completion: Completion,
    },
    Release {
        channel: String,
        reply: oneshot::Sender<Result<(), ErrorInfo>>,
    },
    ChannelState {
        channel: String,
        reply: oneshot::Sender<ChannelState>,
    },
    SubscribeChannelState {
        channel: String,
        reply: oneshot::Sender<mpsc::Receiver<ChannelStateChange>>,
    },
    OnceChannelState {
        channel: String,
        reply: oneshot::Sender<oneshot::Receiver<ChannelStateChange>>,
    },
    SubscribeMessages {
        channel: String,
        name: Option<String>,
        reply: oneshot::Sender<mpsc::Receiver<Message>>,
    },
    SubscribePresence {
        channel: String,
        reply: oneshot::Sender<mpsc::Receiver<PresenceMessage>>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        completion: Completion,
    },
    PresenceOp {
        channel: String,
        presence_action: PresenceAction,
        client_id: Option<String>,
        data: Option<serde_json::Value>,
        completion: Completion,
    },
    PresenceGet {
        channel: String,
        reply: oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>,
    },
    Authorize {
        mechanism: Option<AuthMechanism>,
        params: Option<TokenParams>,
        reply: oneshot::Sender<Result<TokenDetails, ErrorInfo>>,
    },
    ServerTime(oneshot::Sender<Result<i64, ErrorInfo>>),
    DiscardTimeOffset,
}

/// Results reported back by spawned tasks.
enum Internal {
    ConnectResult {
        generation: u64,
        result: Result<Box<dyn Transport>, ErrorInfo>,
    },
    TokenResult {
        generation: u64,
        result: Result<TokenDetails, ErrorInfo>,
    },
    TimeResult {
        result: Result<i64, ErrorInfo>,
        local_at_request: i64,
    },
}

// ---------------------------------------------------------------------------
// ACK/NACK bookkeeping
// ---------------------------------------------------------------------------

struct PendingEntry {
    serial: i64,
    msg: ProtocolMessage,
    completion: Option<Completion>,
}

/// Sent-but-unacknowledged messages, in serial order.
#[derive(Default)]
struct PendingAcks {
    entries: VecDeque<PendingEntry>,
}

impl PendingAcks {
    fn push(&mut self, serial: i64, msg: ProtocolMessage, completion: Option<Completion>) {
        self.entries.push_back(PendingEntry {
            serial,
            msg,
            completion,
        });
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the `[serial, serial + count)` window. Entries below the
    /// window were skipped by the server and fail; entries inside resolve
    /// with `outcome`.
    fn resolve(
        &mut self,
        serial: i64,
        count: i64,
        outcome: &Result<(), ErrorInfo>,
    ) -> Vec<(Option<Completion>, Result<(), ErrorInfo>)> {
        let end = serial + count.max(1);
        let mut resolved = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.serial >= end {
                break;
            }
            let below_window = front.serial < serial;
            if let Some(entry) = self.entries.pop_front() {
                let result = if below_window {
                    Err(ErrorInfo::new(
                        error_code::FAILED,
                        "message skipped by acknowledgement window",
                    ))
                } else {
                    outcome.clone()
                };
                resolved.push((entry.completion, result));
            }
        }
        resolved
    }

    /// Drain everything, e.g. to re-send after a resume or fail on SUSPENDED.
    fn take_all(&mut self) -> Vec<(ProtocolMessage, Option<Completion>)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|e| (e.msg, e.completion))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// All engine-owned deadlines, scanned each loop iteration. `None` means the
/// timer is disarmed.
#[derive(Default)]
struct Timers {
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    token_renewal_at: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.connect_deadline,
            self.close_deadline,
            self.idle_deadline,
            self.token_renewal_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Multiplier in `[0.8, 1.0)` derived from the wall clock, avoiding a
/// dedicated RNG dependency for backoff jitter.
fn jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    0.8 + 0.2 * (f64::from(nanos) / 1_000_000_000.0)
}

/// Jittered exponential backoff for reconnect attempts.
fn backoff_delay(timing: &TimingConfig, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    let raw = timing
        .disconnected_retry_interval
        .saturating_mul(factor)
        .min(timing.disconnected_retry_max);
    raw.mul_f64(jitter())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct Engine {
    timing: TimingConfig,
    realtime_host: String,
    echo_messages: bool,
    queue_messages: bool,
    explicit_client_id: Option<String>,
    transport_factory: Arc<dyn TransportFactory>,

    state: ConnectionState,
    error: Option<ErrorInfo>,
    transport: Option<Box<dyn Transport>>,
    auth: AuthCoordinator,
    channels: HashMap<String, ChannelCore>,
    conn_events: Emitter<ConnectionStateChange>,

    connection_id: Option<String>,
    connection_key: Option<String>,
    /// Effective identity: explicit option, else asserted by the server.
    client_id: Option<String>,
    msg_serial: i64,
    pending: PendingAcks,
    queued: VecDeque<Outbound>,

    retry_count: u32,
    connect_generation: u64,
    /// Set once per connect cycle after curing a token error by renewal; a
    /// second token error in the same cycle is terminal.
    renewed_this_cycle: bool,
    /// Deadline after which a still-down connection degrades to SUSPENDED.
    suspend_at: Option<Instant>,
    connection_state_ttl: Duration,
    max_idle_interval: Option<Duration>,
    timers: Timers,

    ping_waiters: Vec<(Instant, oneshot::Sender<Result<Duration, ErrorInfo>>)>,
    time_waiters: Vec<oneshot::Sender<Result<i64, ErrorInfo>>>,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Engine {
    pub fn new(opts: ClientOptions) -> Result<(Engine, mpsc::UnboundedSender<Command>), Error> {
        let http: Arc<dyn HttpExecutor> = match opts.http.clone() {
            Some(http) => http,
            None => Arc::new(ReqwestExecutor::new(opts.timing.request_timeout)?),
        };
        let transport_factory: Arc<dyn TransportFactory> = match opts.transport.clone() {
            Some(factory) => factory,
            None => Arc::new(WebSocketFactory { secure: opts.tls }),
        };
        let auth = AuthCoordinator::new(opts.auth.clone(), http, opts.rest_base());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            realtime_host: opts.realtime_host(),
            echo_messages: opts.echo_messages,
            queue_messages: opts.queue_messages,
            explicit_client_id: opts.client_id.clone(),
            transport_factory,
            state: ConnectionState::Initialized,
            error: None,
            transport: None,
            auth,
            channels: HashMap::new(),
            conn_events: Emitter::new(opts.timing.event_channel_capacity),
            connection_id: None,
            connection_key: None,
            client_id: opts.client_id.clone(),
            msg_serial: 0,
            pending: PendingAcks::default(),
            queued: VecDeque::new(),
            retry_count: 0,
            connect_generation: 0,
            renewed_this_cycle: false,
            suspend_at: None,
            connection_state_ttl: opts.timing.connection_state_ttl,
            max_idle_interval: None,
            timers: Timers::default(),
            ping_waiters: Vec::new(),
            time_waiters: Vec::new(),
            commands: cmd_rx,
            internal_tx,
            internal_rx,
            timing: opts.timing,
        };
        Ok((engine, cmd_tx))
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Client dropped: tear down.
                        self.shutdown().await;
                        return;
                    }
                },
                internal = self.internal_rx.recv() => {
                    if let Some(internal) = internal {
                        self.handle_internal(internal).await;
                    }
                },
                frame = Self::next_frame(&mut self.transport) => {
                    self.handle_frame(frame).await;
                },
                () = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.handle_deadlines().await;
                },
            }
        }
    }

    async fn next_frame(
        transport: &mut Option<Box<dyn Transport>>,
    ) -> Option<Result<ProtocolMessage, Error>> {
        match transport.as_mut() {
            Some(t) => t.recv().await,
            None => std::future::pending().await,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let channel_next = self
            .channels
            .values()
            .filter_map(|ch| ch.request_deadline)
            .min();
        match (self.timers.next(), channel_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close().await;
        }
    }

    // -- state transitions ---------------------------------------------------

    fn set_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        if previous == state && reason.is_none() {
            return;
        }
        self.state = state;
        if reason.is_some() {
            self.error = reason.clone();
        }
        tracing::info!(%previous, current = %state, "connection state change");
        self.conn_events.emit(&ConnectionStateChange {
            previous,
            current: state,
            reason,
            retry_in,
        });
    }

    /// Error describing why an operation cannot proceed in the current state.
    fn state_error(&self) -> ErrorInfo {
        let (code, what) = match self.state {
            ConnectionState::Failed => (error_code::FAILED, "failed"),
            ConnectionState::Suspended => (error_code::SUSPENDED, "suspended"),
            ConnectionState::Closing | ConnectionState::Closed => (error_code::CLOSED, "closed"),
            _ => (error_code::DISCONNECTED, "not connected"),
        };
        self.error
            .clone()
            .filter(|_| self.state == ConnectionState::Failed)
            .unwrap_or_else(|| ErrorInfo::new(code, format!("connection is {what}")))
    }

    fn start_connect(&mut self) {
        self.set_state(ConnectionState::Connecting, None, None);
        self.timers.retry_at = None;
        self.timers.connect_deadline = Some(Instant::now() + self.timing.connect_timeout);
        self.connect_generation += 1;

        if let Some(credential) = self.auth.valid_credential() {
            let token = credential.token.clone();
            self.spawn_transport_connect(token);
        } else {
            self.begin_token_fetch(None);
        }
    }

    fn spawn_transport_connect(&mut self, token: String) {
        let params = TransportParams {
            host: self.realtime_host.clone(),
            token,
            resume_key: self.resume_key(),
            echo: self.echo_messages,
            client_id: self.explicit_client_id.clone(),
        };
        let factory = Arc::clone(&self.transport_factory);
        let generation = self.connect_generation;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = factory
                .connect(params)
                .await
                .map_err(Error::into_error_info);
            let _ = tx.send(Internal::ConnectResult { generation, result });
        });
    }

    /// Connection key for a resume attempt, provided the state TTL has not
    /// lapsed since the connection dropped.
    fn resume_key(&self) -> Option<String> {
        let still_recoverable = self
            .suspend_at
            .is_none_or(|deadline| Instant::now() < deadline);
        self.connection_key
            .clone()
            .filter(|_| still_recoverable)
    }

    fn begin_token_fetch(&mut self, params: Option<TokenParams>) {
        let generation = self.auth.begin_request();
        let mechanism = Arc::clone(&self.auth.mechanism);
        let http = Arc::clone(&self.auth.http);
        let rest_base = self.auth.rest_base.clone();
        let time_offset = self.auth.time_offset();
        let mut params = params.unwrap_or_default();
        if params.client_id.is_none() {
            params.client_id = self.explicit_client_id.clone();
        }
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetch_token(mechanism, http, rest_base, params, time_offset).await;
            let _ = tx.send(Internal::TokenResult { generation, result });
        });
    }

    fn enter_failed(&mut self, err: ErrorInfo) {
        self.timers = Timers::default();
        self.suspend_at = None;
        self.fail_outbound(&err);
        self.set_state(ConnectionState::Failed, Some(err.clone()), None);
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            if let Some(ch) = self.channels.get_mut(&name) {
                if !matches!(ch.state, ChannelState::Initialized | ChannelState::Detached) {
                    ch.handle_error(err.clone());
                }
            }
        }
    }

    fn enter_closed(&mut self, reason: Option<ErrorInfo>) {
        self.timers = Timers::default();
        self.suspend_at = None;
        let err = ErrorInfo::new(error_code::CLOSED, "connection closed");
        self.fail_outbound(&err);
        if let Some(mut t) = self.transport.take() {
            tokio::spawn(async move { t.close().await });
        }
        self.set_state(ConnectionState::Closed, reason, None);
        for ch in self.channels.values_mut() {
            if !matches!(
                ch.state,
                ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
            ) {
                ch.handle_detached(None);
            }
        }
    }

    fn fail_outbound(&mut self, err: &ErrorInfo) {
        for (_, completion) in self.queued.drain(..) {
            if let Some(c) = completion {
                let _ = c.send(Err(err.clone()));
            }
        }
        for (_, completion) in self.pending.take_all() {
            if let Some(c) = completion {
                let _ = c.send(Err(err.clone()));
            }
        }
        for (_, waiter) in self.ping_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// The transport dropped or refused: schedule a retry, degrading to
    /// SUSPENDED once the connection state TTL lapses.
    fn drop_to_disconnected(&mut self, reason: ErrorInfo) {
        self.transport = None;
        self.timers.connect_deadline = None;
        self.timers.idle_deadline = None;

        if self.state == ConnectionState::Closing {
            self.enter_closed(None);
            return;
        }

        let now = Instant::now();
        let suspend_at = *self
            .suspend_at
            .get_or_insert(now + self.connection_state_ttl);

        if now >= suspend_at {
            let err = ErrorInfo::new(error_code::SUSPENDED, reason.message.clone());
            self.fail_outbound(&err);
            self.connection_key = None;
            let retry = self.timing.suspended_retry_interval;
            self.timers.retry_at = Some(now + retry);
            self.set_state(ConnectionState::Suspended, Some(err.clone()), Some(retry));
            for ch in self.channels.values_mut() {
                ch.handle_suspended(Some(err.clone()));
            }
        } else {
            // Unacknowledged messages go back to the head of the queue for
            // re-send after the resume.
            let resend = self.pending.take_all();
            for outbound in resend.into_iter().rev() {
                self.queued.push_front(outbound);
            }
            let retry = backoff_delay(&self.timing, self.retry_count);
            self.retry_count += 1;
            self.timers.retry_at = Some(now + retry);
            self.set_state(ConnectionState::Disconnected, Some(reason), Some(retry));
        }
    }

    fn handle_connect_failure(&mut self, err: ErrorInfo) {
        if err.is_token_error() {
            if !self.auth.mechanism.is_renewable() || self.renewed_this_cycle {
                self.enter_failed(err);
                return;
            }
            tracing::info!(code = err.code, "token rejected, renewing credential");
            self.renewed_this_cycle = true;
            self.auth.invalidate();
            self.begin_token_fetch(None);
            return;
        }
        if !err.is_retriable() {
            self.enter_failed(err);
            return;
        }
        self.drop_to_disconnected(err);
    }

    // -- commands ------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {}
                ConnectionState::Closing => {
                    tracing::warn!("connect() ignored while closing");
                }
                _ => {
                    self.renewed_this_cycle = false;
                    self.retry_count = 0;
                    if self.state == ConnectionState::Failed {
                        self.error = None;
                        self.connection_key = None;
                        self.connection_id = None;
                    }
                    self.start_connect();
                }
            },
            Command::Close => self.handle_close().await,
            Command::ConnectionState(reply) => {
                let _ = reply.send(self.state);
            }
            Command::ConnectionId(reply) => {
                let _ = reply.send(self.connection_id.clone());
            }
            Command::ConnectionError(reply) => {
                let _ = reply.send(self.error.clone());
            }
            Command::SubscribeConnection(reply) => {
                let _ = reply.send(self.conn_events.subscribe());
            }
            Command::OnceConnection(reply) => {
                let _ = reply.send(self.conn_events.once());
            }
            Command::Ping(reply) => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(self.state_error()));
                } else {
                    self.ping_waiters.push((Instant::now(), reply));
                    let msg = ProtocolMessage {
                        action: action::HEARTBEAT,
                        ..Default::default()
                    };
                    self.transmit(msg, None).await;
                }
            }
            Command::Attach {
                channel,
                completion,
            } => self.handle_attach(&channel, completion).await,
            Command::Detach {
                channel,
                completion,
            } => self.handle_detach(&channel, completion).await,
            Command::Release { channel, reply } => {
                let releasable = self.channels.get(&channel).is_none_or(|ch| {
                    matches!(
                        ch.state,
                        ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
                    )
                });
                if releasable {
                    self.channels.remove(&channel);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(ErrorInfo::new(
                        error_code::BAD_REQUEST,
                        "channel must be detached before it can be released",
                    )));
                }
            }
            Command::ChannelState { channel, reply } => {
                let state = self
                    .channels
                    .get(&channel)
                    .map_or(ChannelState::Initialized, |ch| ch.state);
                let _ = reply.send(state);
            }
            Command::SubscribeChannelState { channel, reply } => {
                let rx = self.channel_mut(&channel).subscribe_state();
                let _ = reply.send(rx);
            }
            Command::OnceChannelState { channel, reply } => {
                let rx = self.channel_mut(&channel).once_state();
                let _ = reply.send(rx);
            }
            Command::SubscribeMessages {
                channel,
                name,
                reply,
            } => {
                let rx = self.channel_mut(&channel).subscribe_messages(name);
                let _ = reply.send(rx);
            }
            Command::SubscribePresence { channel, reply } => {
                let rx = self.channel_mut(&channel).subscribe_presence();
                let _ = reply.send(rx);
            }
            Command::Publish {
                channel,
                messages,
                completion,
            } => {
                let msg = ProtocolMessage {
                    action: action::MESSAGE,
                    channel: Some(channel.clone()),
                    messages: Some(messages),
                    ..Default::default()
                };
                self.submit_channel_op(&channel, msg, completion, false).await;
            }
            Command::PresenceOp {
                channel,
                presence_action,
                client_id,
                data,
                completion,
            } => {
                let Some(client_id) = client_id.or_else(|| self.client_id.clone()) else {
                    let _ = completion.send(Err(ErrorInfo::new(
                        error_code::INVALID_CLIENT_ID,
                        "presence operations require a clientId",
                    )));
                    return;
                };
                let msg = ProtocolMessage {
                    action: action::PRESENCE,
                    channel: Some(channel.clone()),
                    presence: Some(vec![PresenceMessage {
                        action: presence_action,
                        client_id: Some(client_id),
                        data,
                        ..Default::default()
                    }]),
                    ..Default::default()
                };
                self.submit_channel_op(&channel, msg, completion, true).await;
            }
            Command::PresenceGet { channel, reply } => self.handle_presence_get(&channel, reply).await,
            Command::Authorize {
                mechanism,
                params,
                reply,
            } => {
                if let Some(mechanism) = mechanism {
                    self.auth.set_mechanism(mechanism);
                }
                self.auth.invalidate();
                self.auth.add_waiter(reply);
                self.begin_token_fetch(params);
            }
            Command::ServerTime(reply) => {
                self.time_waiters.push(reply);
                let http = Arc::clone(&self.auth.http);
                let rest_base = self.auth.rest_base.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let local_at_request = now_ms();
                    let result = fetch_server_time(http, rest_base).await;
                    let _ = tx.send(Internal::TimeResult {
                        result,
                        local_at_request,
                    });
                });
            }
            Command::DiscardTimeOffset => {
                self.auth.discard_time_offset();
            }
        }
    }

    async fn handle_close(&mut self) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing | ConnectionState::Failed => {}
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Closing, None, None);
                self.timers.close_deadline = Some(Instant::now() + self.timing.close_timeout);
                let msg = ProtocolMessage {
                    action: action::CLOSE,
                    ..Default::default()
                };
                self.transmit(msg, None).await;
            }
            ConnectionState::Connecting => {
                // Abandon the attempt; a late connect result is discarded by
                // its stale generation.
                self.connect_generation += 1;
                self.set_state(ConnectionState::Closing, None, None);
                self.enter_closed(None);
            }
            _ => {
                // No live transport worth a handshake.
                self.enter_closed(None);
            }
        }
    }

    fn channel_mut(&mut self, name: &str) -> &mut ChannelCore {
        let capacity = self.timing.event_channel_capacity;
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelCore::new(name.to_string(), capacity))
    }

    async fn handle_attach(&mut self, name: &str, completion: Completion) {
        if !self.state.is_active() {
            let _ = completion.send(Err(self.state_error()));
            return;
        }
        let ch = self.channel_mut(name);
        match ch.state {
            ChannelState::Attached => {
                let _ = completion.send(Ok(()));
            }
            ChannelState::Attaching => ch.add_attach_waiter(completion),
            _ => {
                ch.add_attach_waiter(completion);
                self.start_attach(name).await;
            }
        }
    }

    /// Move a channel to ATTACHING and send ATTACH if the transport is up;
    /// otherwise the ATTACH goes out when CONNECTED arrives.
    async fn start_attach(&mut self, name: &str) {
        let connected = self.state == ConnectionState::Connected;
        let request_timeout = self.timing.request_timeout;
        let ch = self.channel_mut(name);
        ch.set_state(ChannelState::Attaching, None, false);
        if connected {
            ch.request_deadline = Some(Instant::now() + request_timeout);
            let msg = ch.attach_message();
            self.transmit(msg, None).await;
        }
    }

    async fn handle_detach(&mut self, name: &str, completion: Completion) {
        let connected = self.state == ConnectionState::Connected;
        let request_timeout = self.timing.request_timeout;
        let ch = self.channel_mut(name);
        match ch.state {
            ChannelState::Initialized | ChannelState::Detached => {
                let _ = completion.send(Ok(()));
            }
            ChannelState::Failed => {
                let _ = completion.send(Err(ch.state_error()));
            }
            ChannelState::Detaching => ch.add_detach_waiter(completion),
            ChannelState::Suspended => {
                // No server-side state to release.
                ch.handle_detached(None);
                let _ = completion.send(Ok(()));
            }
            ChannelState::Attached | ChannelState::Attaching => {
                if connected {
                    ch.add_detach_waiter(completion);
                    ch.set_state(ChannelState::Detaching, None, false);
                    ch.request_deadline = Some(Instant::now() + request_timeout);
                    let msg = ch.detach_message();
                    self.transmit(msg, None).await;
                } else {
                    ch.handle_detached(None);
                    let _ = completion.send(Ok(()));
                }
            }
        }
    }

    /// Route a publish or presence operation through the channel gate:
    /// ATTACHED sends (or queues at the connection), ATTACHING buffers at the
    /// channel, INITIALIZED triggers an implicit attach first, anything else
    /// fails fast.
    async fn submit_channel_op(
        &mut self,
        name: &str,
        msg: ProtocolMessage,
        completion: Completion,
        requires_attach: bool,
    ) {
        if !self.state.is_active() {
            let _ = completion.send(Err(self.state_error()));
            return;
        }
        let ch = self.channel_mut(name);
        match ch.state {
            ChannelState::Failed => {
                let _ = completion.send(Err(ch.state_error()));
            }
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Detaching => {
                let _ = completion.send(Err(ch.state_error()));
            }
            ChannelState::Attaching => ch.buffer_op(msg, Some(completion)),
            ChannelState::Attached => self.send_or_queue(msg, Some(completion)).await,
            ChannelState::Initialized => {
                if requires_attach {
                    ch.buffer_op(msg, Some(completion));
                    self.start_attach(name).await;
                } else {
                    self.send_or_queue(msg, Some(completion)).await;
                }
            }
        }
    }

    async fn handle_presence_get(
        &mut self,
        name: &str,
        reply: oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>,
    ) {
        if !self.state.is_active() {
            let _ = reply.send(Err(self.state_error()));
            return;
        }
        let ch = self.channel_mut(name);
        match ch.state {
            ChannelState::Attached if !ch.presence.sync_in_progress() => {
                let _ = reply.send(Ok(ch.presence.members()));
            }
            ChannelState::Attached | ChannelState::Attaching => ch.add_get_waiter(reply),
            ChannelState::Initialized => {
                ch.add_get_waiter(reply);
                self.start_attach(name).await;
            }
            _ => {
                let _ = reply.send(Err(ch.state_error()));
            }
        }
    }

    // -- sending -------------------------------------------------------------

    async fn send_or_queue(&mut self, msg: ProtocolMessage, completion: Option<Completion>) {
        if self.state == ConnectionState::Connected && self.transport.is_some() {
            self.transmit(msg, completion).await;
        } else if self.queue_messages && self.state.is_active() {
            if self.queued.len() >= self.timing.queue_capacity {
                tracing::warn!("outbound queue full, failing message");
                if let Some(c) = completion {
                    let _ = c.send(Err(ErrorInfo::new(
                        error_code::DISCONNECTED,
                        "outbound message queue is full",
                    )));
                }
                return;
            }
            self.queued.push_back((msg, completion));
        } else if let Some(c) = completion {
            let _ = c.send(Err(self.state_error()));
        }
    }

    /// Write to the live transport, assigning a serial (and registering for
    /// ACK) for data-bearing actions. A write failure drops the connection.
    async fn transmit(&mut self, mut msg: ProtocolMessage, completion: Option<Completion>) {
        if matches!(msg.action, action::MESSAGE | action::PRESENCE) {
            // A message carrying a serial is a retransmission after a resume;
            // it must go out under its original serial so the server can
            // correlate and dedupe it.
            let serial = match msg.msg_serial {
                Some(serial) => serial,
                None => {
                    let serial = self.msg_serial;
                    self.msg_serial += 1;
                    serial
                }
            };
            msg.msg_serial = Some(serial);
            self.pending.push(serial, msg.clone(), completion);
        } else if let Some(c) = completion {
            // Non-acknowledged action: completing the write is the outcome.
            let _ = c.send(Ok(()));
        }
        let result = match self.transport.as_mut() {
            Some(t) => t.send(&msg).await,
            None => return,
        };
        if let Err(e) = result {
            tracing::warn!("transport write failed: {e}");
            self.drop_to_disconnected(e.into_error_info());
        }
    }

    async fn flush_queued(&mut self) {
        while self.state == ConnectionState::Connected {
            let Some((msg, completion)) = self.queued.pop_front() else {
                break;
            };
            self.transmit(msg, completion).await;
        }
    }

    // -- inbound frames ------------------------------------------------------

    async fn handle_frame(&mut self, frame: Option<Result<ProtocolMessage, Error>>) {
        match frame {
            None => {
                tracing::info!("transport closed by peer");
                self.drop_to_disconnected(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    "transport closed",
                ));
            }
            Some(Err(e)) => {
                tracing::warn!("transport error: {e}");
                self.drop_to_disconnected(e.into_error_info());
            }
            Some(Ok(msg)) => {
                self.touch_idle_deadline();
                self.dispatch(msg).await;
            }
        }
    }

    fn touch_idle_deadline(&mut self) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Connecting {
            if let Some(idle) = self.max_idle_interval {
                self.timers.idle_deadline =
                    Some(Instant::now() + idle + self.timing.heartbeat_margin);
            }
        }
    }

    async fn dispatch(&mut self, msg: ProtocolMessage) {
        match msg.action {
            action::HEARTBEAT => {
                for (started, waiter) in self.ping_waiters.drain(..) {
                    let _ = waiter.send(Ok(started.elapsed()));
                }
            }
            action::CONNECTED => self.handle_connected(msg).await,
            action::ACK => {
                let serial = msg.msg_serial.unwrap_or(0);
                let count = msg.count.unwrap_or(1);
                for (completion, result) in self.pending.resolve(serial, count, &Ok(())) {
                    if let Some(c) = completion {
                        let _ = c.send(result);
                    }
                }
            }
            action::NACK => {
                let serial = msg.msg_serial.unwrap_or(0);
                let count = msg.count.unwrap_or(1);
                let err = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(error_code::FAILED, "message not accepted")
                });
                for (completion, result) in self.pending.resolve(serial, count, &Err(err)) {
                    if let Some(c) = completion {
                        let _ = c.send(result);
                    }
                }
            }
            action::DISCONNECT | action::DISCONNECTED => {
                let err = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(error_code::DISCONNECTED, "server disconnected")
                });
                if err.is_token_error() && self.auth.mechanism.is_renewable() {
                    self.auth.invalidate();
                }
                if let Some(mut t) = self.transport.take() {
                    tokio::spawn(async move { t.close().await });
                }
                self.drop_to_disconnected(err);
            }
            action::CLOSE | action::CLOSED => {
                if let Some(mut t) = self.transport.take() {
                    tokio::spawn(async move { t.close().await });
                }
                self.enter_closed(msg.error.clone());
            }
            action::ERROR => {
                if msg.channel.is_some() {
                    self.channel_event(msg).await;
                } else {
                    self.handle_connection_error(msg).await;
                }
            }
            action::AUTH => {
                // Server-initiated reauth: fetch a fresh credential and
                // present it in place. The cached credential stays usable
                // until the replacement lands, so a failed fetch here is
                // non-terminal.
                tracing::info!("server requested reauthentication");
                if !self.auth.in_flight() {
                    self.begin_token_fetch(None);
                }
            }
            action::ATTACHED
            | action::DETACHED
            | action::MESSAGE
            | action::PRESENCE
            | action::SYNC => self.channel_event(msg).await,
            other => {
                tracing::debug!(action = other, "ignoring unhandled action");
            }
        }
    }

    async fn handle_connected(&mut self, msg: ProtocolMessage) {
        let previous_connection_id = self.connection_id.clone();
        let resumed =
            previous_connection_id.is_some() && previous_connection_id == msg.connection_id;

        self.timers.connect_deadline = None;
        self.timers.retry_at = None;
        self.retry_count = 0;
        self.renewed_this_cycle = false;
        self.suspend_at = None;

        self.connection_id = msg.connection_id.clone();
        if let Some(details) = &msg.connection_details {
            if let Some(key) = &details.connection_key {
                self.connection_key = Some(key.clone());
            }
            if self.explicit_client_id.is_none() {
                if let Some(client_id) = &details.client_id {
                    self.client_id = Some(client_id.clone());
                }
            }
            if let Some(ttl) = details.connection_state_ttl {
                self.connection_state_ttl = Duration::from_millis(ttl.max(0) as u64);
            }
            if let Some(idle) = details.max_idle_interval {
                self.max_idle_interval = Some(Duration::from_millis(idle.max(0) as u64));
            }
        }
        if let Some(key) = &msg.connection_key {
            self.connection_key = Some(key.clone());
        }

        let was_connected = self.state == ConnectionState::Connected;
        if was_connected {
            // In-place update (e.g. after AUTH): refresh details only, no
            // transition.
            if let Some(err) = msg.error.clone() {
                tracing::warn!("connection update carried error: {err}");
                self.error = Some(err);
            }
            return;
        }

        if !resumed {
            // Fresh connection: serials restart and unacknowledged messages
            // are re-sent under new serials.
            self.msg_serial = 0;
            let resend = self.pending.take_all();
            for outbound in resend.into_iter().rev() {
                self.queued.push_front(outbound);
            }
            for (m, _) in &mut self.queued {
                m.msg_serial = None;
            }
        }

        self.set_state(ConnectionState::Connected, msg.error.clone(), None);
        self.touch_idle_deadline();
        self.arm_token_renewal();

        let connection_id = self.connection_id.clone();
        let resume_failed = previous_connection_id.is_some() && !resumed;
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let Some(ch) = self.channels.get_mut(&name) else {
                continue;
            };
            ch.presence.set_connection_id(connection_id.clone());
            match ch.state {
                ChannelState::Attaching => {
                    ch.request_deadline = Some(Instant::now() + self.timing.request_timeout);
                    let attach = ch.attach_message();
                    self.transmit(attach, None).await;
                }
                ChannelState::Attached if resume_failed || msg.error.is_some() => {
                    ch.set_state(ChannelState::Attaching, msg.error.clone(), false);
                    ch.request_deadline = Some(Instant::now() + self.timing.request_timeout);
                    let attach = ch.attach_message();
                    self.transmit(attach, None).await;
                }
                ChannelState::Suspended => {
                    ch.set_state(ChannelState::Attaching, None, false);
                    ch.request_deadline = Some(Instant::now() + self.timing.request_timeout);
                    let attach = ch.attach_message();
                    self.transmit(attach, None).await;
                }
                ChannelState::Detaching => {
                    let detach = ch.detach_message();
                    self.transmit(detach, None).await;
                }
                _ => {}
            }
        }
        self.flush_queued().await;
    }

    async fn handle_connection_error(&mut self, msg: ProtocolMessage) {
        let err = msg
            .error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(error_code::FAILED, "connection error"));
        if let Some(mut t) = self.transport.take() {
            tokio::spawn(async move { t.close().await });
        }
        if err.is_token_error() && self.auth.mechanism.is_renewable() && !self.renewed_this_cycle {
            tracing::info!(code = err.code, "token rejected, renewing and reconnecting");
            self.renewed_this_cycle = true;
            self.auth.invalidate();
            self.set_state(ConnectionState::Connecting, Some(err), None);
            self.timers.connect_deadline = Some(Instant::now() + self.timing.connect_timeout);
            self.connect_generation += 1;
            self.begin_token_fetch(None);
        } else {
            self.enter_failed(err);
        }
    }

    async fn channel_event(&mut self, msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            return;
        };
        let Some(ch) = self.channels.get_mut(&name) else {
            tracing::debug!(channel = %name, "event for unknown channel dropped");
            return;
        };
        match msg.action {
            action::ATTACHED => {
                let out = ch.handle_attached(&msg);
                for (m, completion) in out {
                    self.send_or_queue(m, completion).await;
                }
            }
            action::DETACHED => {
                if ch.state == ChannelState::Detaching {
                    ch.handle_detached(msg.error.clone());
                } else {
                    // Unsolicited DETACHED: the server dropped our attachment,
                    // re-establish it.
                    ch.handle_detached(msg.error.clone());
                    self.start_attach(&name).await;
                }
            }
            action::MESSAGE => ch.handle_message(&msg),
            action::PRESENCE => ch.handle_presence(&msg),
            action::SYNC => ch.handle_sync(&msg),
            action::ERROR => {
                let err = msg
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::new(error_code::CHANNEL_OPERATION_FAILED, "channel error"));
                ch.handle_error(err);
            }
            _ => {}
        }
    }

    // -- internal results ----------------------------------------------------

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ConnectResult { generation, result } => {
                if generation != self.connect_generation
                    || self.state != ConnectionState::Connecting
                {
                    tracing::debug!("discarding superseded connect result");
                    if let Ok(mut t) = result {
                        tokio::spawn(async move { t.close().await });
                    }
                    return;
                }
                match result {
                    Ok(transport) => {
                        // Handshake continues when CONNECTED arrives; the
                        // connect deadline stays armed until then.
                        self.transport = Some(transport);
                    }
                    Err(err) => self.handle_connect_failure(err),
                }
            }
            Internal::TokenResult { generation, result } => {
                let current = generation == self.auth.current_generation();
                let waiters = self.auth.complete_request(generation, &result);
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                if current {
                    self.after_token_result(result).await;
                }
            }
            Internal::TimeResult {
                result,
                local_at_request,
            } => {
                if let Ok(server_time) = &result {
                    self.auth.set_time_offset(*server_time, local_at_request);
                }
                for waiter in self.time_waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    async fn after_token_result(&mut self, result: Result<TokenDetails, ErrorInfo>) {
        match result {
            Ok(details) => match self.state {
                ConnectionState::Connecting if self.transport.is_none() => {
                    self.spawn_transport_connect(details.token);
                }
                ConnectionState::Connected => {
                    self.arm_token_renewal();
                    let msg = ProtocolMessage {
                        action: action::AUTH,
                        auth: Some(AuthDetails {
                            access_token: details.token,
                        }),
                        ..Default::default()
                    };
                    self.transmit(msg, None).await;
                }
                _ => {}
            },
            Err(err) => match self.state {
                ConnectionState::Connecting => {
                    let err = if err.is_token_error() {
                        err
                    } else {
                        ErrorInfo::with_status(
                            error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                            err.status_code.unwrap_or(401),
                            format!("credential provider failed: {}", err.message),
                        )
                    };
                    // Provider failures while connecting are retried through
                    // the normal disconnected cycle; token errors follow the
                    // renew-once rule.
                    if err.is_token_error() {
                        self.handle_connect_failure(err);
                    } else {
                        self.drop_to_disconnected(err);
                    }
                }
                ConnectionState::Connected => {
                    tracing::warn!("proactive token renewal failed: {err}");
                    self.timers.token_renewal_at =
                        Some(Instant::now() + self.timing.token_renewal_retry_delay);
                }
                _ => {}
            },
        }
    }

    /// Schedule a proactive renewal ahead of credential expiry, when the
    /// expiry is known and the mechanism can renew.
    fn arm_token_renewal(&mut self) {
        self.timers.token_renewal_at = None;
        if !self.auth.mechanism.is_renewable() {
            return;
        }
        let Some(credential) = self.auth.credential() else {
            return;
        };
        if credential.expires == 0 {
            return;
        }
        let margin_ms = self.timing.token_renewal_margin.as_millis() as i64;
        let remaining_ms = credential.expires - margin_ms - self.auth.timestamp();
        let delay = Duration::from_millis(remaining_ms.max(0) as u64);
        self.timers.token_renewal_at = Some(Instant::now() + delay);
    }

    // -- deadlines -----------------------------------------------------------

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        if self.timers.retry_at.is_some_and(|at| now >= at) {
            self.timers.retry_at = None;
            if matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Suspended
            ) {
                self.start_connect();
            }
        }

        if self.timers.connect_deadline.is_some_and(|at| now >= at) {
            self.timers.connect_deadline = None;
            if self.state == ConnectionState::Connecting {
                self.connect_generation += 1; // a late transport is discarded
                self.handle_connect_failure(ErrorInfo::new(
                    error_code::CONNECTION_TIMED_OUT,
                    "connection attempt timed out",
                ));
            }
        }

        if self.timers.close_deadline.is_some_and(|at| now >= at) {
            self.timers.close_deadline = None;
            if self.state == ConnectionState::Closing {
                tracing::warn!("no CLOSED from server, forcing closed");
                self.enter_closed(None);
            }
        }

        if self.timers.idle_deadline.is_some_and(|at| now >= at) {
            self.timers.idle_deadline = None;
            if self.state == ConnectionState::Connected {
                tracing::warn!("connection idle past max interval, presuming dead");
                if let Some(mut t) = self.transport.take() {
                    tokio::spawn(async move { t.close().await });
                }
                self.drop_to_disconnected(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    "no activity within the idle interval",
                ));
            }
        }

        if self.timers.token_renewal_at.is_some_and(|at| now >= at) {
            self.timers.token_renewal_at = None;
            if self.state == ConnectionState::Connected && !self.auth.in_flight() {
                // The old credential is kept until the new one arrives; it is
                // still good for the renewal margin.
                tracing::info!("proactively renewing credential ahead of expiry");
                self.begin_token_fetch(None);
            }
        }

        // Channel request deadlines.
        let expired: Vec<(String, ChannelState)> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.request_deadline.is_some_and(|at| now >= at))
            .map(|(name, ch)| (name.clone(), ch.state))
            .collect();
        for (name, state) in expired {
            let Some(ch) = self.channels.get_mut(&name) else {
                continue;
            };
            match state {
                ChannelState::Attaching => {
                    tracing::warn!(channel = %name, "attach timed out");
                    ch.handle_suspended(Some(ErrorInfo::new(
                        error_code::CHANNEL_OPERATION_TIMED_OUT,
                        "attach operation timed out",
                    )));
                }
                ChannelState::Detaching => {
                    tracing::warn!(channel = %name, "detach timed out");
                    ch.handle_detach_timeout(ErrorInfo::new(
                        error_code::CHANNEL_OPERATION_TIMED_OUT,
                        "detach operation timed out",
                    ));
                }
                _ => ch.request_deadline = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_within_jitter_bounds() {
        let timing = TimingConfig::default();
        let base = timing.disconnected_retry_interval;
        for retry in 0..5u32 {
            let d = backoff_delay(&timing, retry);
            let raw = base
                .saturating_mul(2u32.pow(retry))
                .min(timing.disconnected_retry_max);
            assert!(d >= raw.mul_f64(0.8), "retry {retry}: {d:?} below floor");
            assert!(d <= raw, "retry {retry}: {d:?} above raw");
        }
        // Saturates at the cap.
        let d = backoff_delay(&timing, 30);
        assert!(d <= timing.disconnected_retry_max);
    }

    fn entry(serial: i64) -> ProtocolMessage {
        ProtocolMessage {
            action: action::MESSAGE,
            msg_serial: Some(serial),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ack_resolves_window_in_order() {
        let mut pending = PendingAcks::default();
        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (tx, rx) = oneshot::channel();
            pending.push(serial, entry(serial), Some(tx));
            rxs.push(rx);
        }
        for (completion, result) in pending.resolve(0, 2, &Ok(())) {
            if let Some(c) = completion {
                let _ = c.send(result);
            }
        }
        let mut iter = rxs.into_iter();
        for _ in 0..2 {
            let mut rx = iter.next().unwrap();
            assert!(rx.try_recv().unwrap().is_ok());
        }
        // Serial 2 remains pending.
        let mut rx = iter.next().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!pending.is_empty());
    }

    #[tokio::test]
    async fn nack_fails_window_with_server_error() {
        let mut pending = PendingAcks::default();
        let (tx, mut rx) = oneshot::channel();
        pending.push(5, entry(5), Some(tx));
        let err = ErrorInfo::new(40160, "not permitted");
        for (completion, result) in pending.resolve(5, 1, &Err(err.clone())) {
            if let Some(c) = completion {
                let _ = c.send(result);
            }
        }
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 40160);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn ack_window_skipping_entries_fails_them() {
        let mut pending = PendingAcks::default();
        let (tx0, mut rx0) = oneshot::channel();
        let (tx1, mut rx1) = oneshot::channel();
        pending.push(0, entry(0), Some(tx0));
        pending.push(1, entry(1), Some(tx1));
        // Server acknowledges starting at serial 1: serial 0 was skipped.
        for (completion, result) in pending.resolve(1, 1, &Ok(())) {
            if let Some(c) = completion {
                let _ = c.send(result);
            }
        }
        assert!(rx0.try_recv().unwrap().is_err());
        assert!(rx1.try_recv().unwrap().is_ok());
    }

    #[test]
    fn take_all_preserves_send_order() {
        let mut pending = PendingAcks::default();
        pending.push(0, entry(0), None);
        pending.push(1, entry(1), None);
        let drained = pending.take_all();
        let serials: Vec<_> = drained.iter().map(|(m, _)| m.msg_serial).collect();
        assert_eq!(serials, vec![Some(0), Some(1)]);
        assert!(pending.is_empty());
    }

    #[test]
    fn timers_next_picks_earliest() {
        let now = Instant::now();
        let mut timers = Timers::default();
        assert!(timers.next().is_none());
        timers.retry_at = Some(now + Duration::from_secs(5));
        timers.idle_deadline = Some(now + Duration::from_secs(2));
        assert_eq!(timers.next(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Initialized.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Suspended.is_active());
        assert!(!ConnectionState::Closing.is_active());
        assert!(!ConnectionState::Closed.is_active());
        assert!(!ConnectionState::Failed.is_active());
    }
}
