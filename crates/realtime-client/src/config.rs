//! Client configuration: auth mechanism, hosts, queueing, and timing knobs.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthMechanism;
use crate::http::HttpExecutor;
use crate::transport::TransportFactory;

pub const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";
pub const DEFAULT_REST_HOST: &str = "rest.ably.io";

/// Derive the REST host from the realtime host.
pub(crate) fn rest_host_for(realtime_host: &str) -> String {
    if realtime_host == DEFAULT_REALTIME_HOST {
        DEFAULT_REST_HOST.to_string()
    } else {
        realtime_host.to_string()
    }
}

/// Timing knobs. Defaults match production behavior; tests shrink them.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Timeout for the transport open + CONNECTED handshake.
    pub connect_timeout: Duration,
    /// Timeout for any request awaiting a server reply (ATTACH, DETACH, auth).
    pub request_timeout: Duration,
    /// Base interval for the jittered exponential reconnect backoff.
    pub disconnected_retry_interval: Duration,
    /// Cap for the reconnect backoff.
    pub disconnected_retry_max: Duration,
    /// Fixed retry interval once the connection is SUSPENDED.
    pub suspended_retry_interval: Duration,
    /// How long connection state (resume eligibility) survives disconnection.
    /// The server value from CONNECTED overrides this.
    pub connection_state_ttl: Duration,
    /// Grace period on top of the server's max idle interval before the
    /// connection is considered dead.
    pub heartbeat_margin: Duration,
    /// How long before token expiry a proactive renewal is started.
    pub token_renewal_margin: Duration,
    /// Delay before retrying a failed non-terminal token renewal.
    pub token_renewal_retry_delay: Duration,
    /// How long to wait for the server's CLOSED before forcing CLOSED.
    pub close_timeout: Duration,
    /// Bound on the queued-message buffer held while not CONNECTED.
    pub queue_capacity: usize,
    /// Capacity of subscriber event channels (messages dropped beyond it).
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            disconnected_retry_interval: Duration::from_secs(1),
            disconnected_retry_max: Duration::from_secs(15),
            suspended_retry_interval: Duration::from_secs(30),
            connection_state_ttl: Duration::from_secs(120),
            heartbeat_margin: Duration::from_secs(10),
            token_renewal_margin: Duration::from_secs(300),
            token_renewal_retry_delay: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
            queue_capacity: 128,
            event_channel_capacity: 64,
        }
    }
}

/// Options for constructing a [`RealtimeClient`](crate::RealtimeClient).
pub struct ClientOptions {
    /// How credentials are produced (exactly one mechanism).
    pub auth: AuthMechanism,
    /// Client identity asserted in presence operations. When `None`, the
    /// identity from the issued token (if any) is used.
    pub client_id: Option<String>,
    /// Realtime (WebSocket) host override.
    pub realtime_host: Option<String>,
    /// REST host override, used for token exchange and server time.
    pub rest_host: Option<String>,
    /// Use TLS (`wss`/`https`). Tests against local plain-text listeners
    /// disable this.
    pub tls: bool,
    /// Whether messages published on this connection are echoed back to it.
    pub echo_messages: bool,
    /// Whether outbound operations are queued while not CONNECTED. When
    /// disabled they fail immediately with a connectivity error.
    pub queue_messages: bool,
    /// Whether `connect()` is called implicitly at construction.
    pub auto_connect: bool,
    pub timing: TimingConfig,
    /// Transport override; `None` uses the WebSocket transport.
    pub transport: Option<Arc<dyn TransportFactory>>,
    /// HTTP executor override; `None` uses reqwest.
    pub http: Option<Arc<dyn HttpExecutor>>,
}

impl ClientOptions {
    pub fn new(auth: AuthMechanism) -> Self {
        ClientOptions {
            auth,
            client_id: None,
            realtime_host: None,
            rest_host: None,
            tls: true,
            echo_messages: true,
            queue_messages: true,
            auto_connect: true,
            timing: TimingConfig::default(),
            transport: None,
            http: None,
        }
    }

    pub(crate) fn realtime_host(&self) -> String {
        self.realtime_host
            .clone()
            .unwrap_or_else(|| DEFAULT_REALTIME_HOST.to_string())
    }

    pub(crate) fn rest_host(&self) -> String {
        self.rest_host
            .clone()
            .unwrap_or_else(|| rest_host_for(&self.realtime_host()))
    }

    /// Scheme-qualified REST base URL for token exchange and server time.
    pub(crate) fn rest_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.rest_host())
    }
}
