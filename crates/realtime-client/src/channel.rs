//! Per-channel lifecycle state machine.
//!
//! A `ChannelCore` owns its [`PresenceMap`] and pending-operation queue and is
//! mutated only on the engine's execution context. Sending goes through the
//! owning connection; this module produces the outbound messages and the
//! connection decides whether to transmit or queue them.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{ErrorInfo, error_code};
use crate::events::Emitter;
use crate::presence::{PresenceMap, is_last_sync_page};
use crate::protocol::{
    Message, PresenceAction, PresenceMessage, ProtocolMessage, action, decode_data, flags,
};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Delivered to channel state listeners on every transition.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// Set when the server confirmed message continuity across a resume.
    pub resumed: bool,
}

pub(crate) type Completion = oneshot::Sender<Result<(), ErrorInfo>>;
pub(crate) type Outbound = (ProtocolMessage, Option<Completion>);
type GetWaiter = oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>;

pub(crate) struct ChannelCore {
    pub name: String,
    pub state: ChannelState,
    pub error: Option<ErrorInfo>,
    /// Serial from the last ATTACHED, sent back on re-attach for continuity.
    pub attach_serial: Option<String>,
    pub presence: PresenceMap,
    /// Deadline for an in-flight ATTACH or DETACH request.
    pub request_deadline: Option<Instant>,
    pending: VecDeque<Outbound>,
    attach_waiters: Vec<Completion>,
    detach_waiters: Vec<Completion>,
    get_waiters: Vec<GetWaiter>,
    state_events: Emitter<ChannelStateChange>,
    message_subs: Vec<(Option<String>, mpsc::Sender<Message>)>,
    presence_subs: Vec<mpsc::Sender<PresenceMessage>>,
    capacity: usize,
}

impl ChannelCore {
    pub fn new(name: String, capacity: usize) -> Self {
        ChannelCore {
            name,
            state: ChannelState::Initialized,
            error: None,
            attach_serial: None,
            presence: PresenceMap::new(),
            request_deadline: None,
            pending: VecDeque::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            get_waiters: Vec::new(),
            state_events: Emitter::new(capacity),
            message_subs: Vec::new(),
            presence_subs: Vec::new(),
            capacity,
        }
    }

    // -- listeners ----------------------------------------------------------

    pub fn subscribe_state(&mut self) -> mpsc::Receiver<ChannelStateChange> {
        self.state_events.subscribe()
    }

    pub fn once_state(&mut self) -> oneshot::Receiver<ChannelStateChange> {
        self.state_events.once()
    }

    pub fn subscribe_messages(&mut self, name: Option<String>) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.message_subs.push((name, tx));
        rx
    }

    pub fn subscribe_presence(&mut self) -> mpsc::Receiver<PresenceMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.presence_subs.push(tx);
        rx
    }

    // -- state --------------------------------------------------------------

    pub fn set_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    ) {
        if self.state == state && reason.is_none() {
            return;
        }
        let previous = self.state;
        self.state = state;
        if reason.is_some() {
            self.error = reason.clone();
        }
        tracing::debug!(channel = %self.name, %previous, current = %state, "channel state change");
        self.state_events.emit(&ChannelStateChange {
            previous,
            current: state,
            reason,
            resumed,
        });
    }

    pub fn state_error(&self) -> ErrorInfo {
        ErrorInfo::new(
            error_code::CHANNEL_OPERATION_FAILED_INVALID_STATE,
            format!("channel {} is {}", self.name, self.state),
        )
    }

    // -- pending operations --------------------------------------------------

    /// Buffer an operation issued while ATTACHING; flushed in submission
    /// order on ATTACHED.
    pub fn buffer_op(&mut self, msg: ProtocolMessage, completion: Option<Completion>) {
        self.pending.push_back((msg, completion));
    }

    pub fn take_pending(&mut self) -> VecDeque<Outbound> {
        std::mem::take(&mut self.pending)
    }

    /// Fail every buffered operation and in-flight waiter exactly once.
    pub fn fail_pending(&mut self, err: &ErrorInfo) {
        for (_, completion) in self.pending.drain(..) {
            if let Some(c) = completion {
                let _ = c.send(Err(err.clone()));
            }
        }
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for waiter in self.get_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub fn add_attach_waiter(&mut self, waiter: Completion) {
        self.attach_waiters.push(waiter);
    }

    pub fn add_detach_waiter(&mut self, waiter: Completion) {
        self.detach_waiters.push(waiter);
    }

    pub fn add_get_waiter(&mut self, waiter: GetWaiter) {
        self.get_waiters.push(waiter);
    }

    // -- outbound builders ---------------------------------------------------

    pub fn attach_message(&self) -> ProtocolMessage {
        let (serial, f) = match &self.attach_serial {
            Some(s) => (Some(s.clone()), flags::ATTACH_RESUME),
            None => (None, 0),
        };
        ProtocolMessage {
            action: action::ATTACH,
            channel: Some(self.name.clone()),
            channel_serial: serial,
            flags: (f != 0).then_some(f),
            ..Default::default()
        }
    }

    pub fn detach_message(&self) -> ProtocolMessage {
        ProtocolMessage {
            action: action::DETACH,
            channel: Some(self.name.clone()),
            ..Default::default()
        }
    }

    /// ENTER replays for local members after a resume, carrying their
    /// original message ids so duplicates dedupe via the newness comparison.
    pub fn replay_local_members(&self) -> Vec<Outbound> {
        self.presence
            .local_members()
            .into_iter()
            .map(|member| {
                let replay = PresenceMessage {
                    action: PresenceAction::Enter,
                    ..member
                };
                (
                    ProtocolMessage {
                        action: action::PRESENCE,
                        channel: Some(self.name.clone()),
                        presence: Some(vec![replay]),
                        ..Default::default()
                    },
                    None,
                )
            })
            .collect()
    }

    // -- inbound handlers ----------------------------------------------------

    /// Server ATTACHED. Returns the buffered operations and presence replays
    /// to transmit, in order.
    pub fn handle_attached(&mut self, msg: &ProtocolMessage) -> Vec<Outbound> {
        self.request_deadline = None;
        if let Some(serial) = &msg.channel_serial {
            self.attach_serial = Some(serial.clone());
        }
        let resumed = msg.has_flag(flags::HAS_CHANNEL_RESUMED);
        self.set_state(ChannelState::Attached, msg.error.clone(), resumed);
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let mut out: Vec<Outbound> = Vec::new();
        if resumed {
            // Continuity preserved: no re-SYNC; re-assert our own members.
            out.extend(self.replay_local_members());
        } else if msg.has_flag(flags::HAS_PRESENCE) {
            self.presence.start_sync();
        } else if !self.presence.is_empty() {
            // The server holds no presence state for us (e.g. it was lost
            // across a resume): every existing member has left.
            self.presence.start_sync();
            let leaves = self.presence.end_sync();
            for leave in leaves {
                self.emit_presence(leave);
            }
        }
        out.extend(self.take_pending());
        self.resolve_get_waiters();
        out
    }

    /// Server DETACHED, or local detach confirmation.
    pub fn handle_detached(&mut self, error: Option<ErrorInfo>) {
        self.request_deadline = None;
        let err = error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(error_code::CHANNEL_OPERATION_FAILED, "channel detached"));
        self.presence.reset();
        self.attach_serial = None;
        self.set_state(ChannelState::Detached, error, false);
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.fail_pending(&err);
    }

    /// Channel-scoped ERROR: terminal. Clears presence (local members
    /// included) without synthetic leaves and fails everything pending.
    pub fn handle_error(&mut self, error: ErrorInfo) {
        self.request_deadline = None;
        self.presence.reset();
        self.set_state(ChannelState::Failed, Some(error.clone()), false);
        self.fail_pending(&error);
    }

    /// An in-flight DETACH got no reply in time: revert to ATTACHED and fail
    /// only the detach waiters.
    pub fn handle_detach_timeout(&mut self, err: ErrorInfo) {
        self.request_deadline = None;
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        self.set_state(ChannelState::Attached, Some(err), false);
    }

    /// The owning connection degraded to SUSPENDED (or an attach timed out
    /// while it was degrading).
    pub fn handle_suspended(&mut self, error: Option<ErrorInfo>) {
        self.request_deadline = None;
        let err = error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(error_code::SUSPENDED, "channel suspended"));
        if matches!(self.state, ChannelState::Attached | ChannelState::Attaching) {
            self.set_state(ChannelState::Suspended, error, false);
            self.fail_pending(&err);
        }
    }

    /// Inbound MESSAGE: resolve encoding layers and deliver to subscribers.
    pub fn handle_message(&mut self, msg: &ProtocolMessage) {
        if let Some(serial) = &msg.channel_serial {
            self.attach_serial = Some(serial.clone());
        }
        let Some(messages) = &msg.messages else {
            return;
        };
        for (i, m) in messages.iter().enumerate() {
            let mut delivered = m.clone();
            delivered.data = delivered
                .data
                .map(|d| decode_data(d, m.encoding.as_deref()));
            delivered.encoding = None;
            if delivered.id.is_none() {
                delivered.id = msg.id.as_ref().map(|pid| format!("{pid}:{i}"));
            }
            if delivered.timestamp.is_none() {
                delivered.timestamp = msg.timestamp;
            }
            if delivered.connection_id.is_none() {
                delivered.connection_id = msg.connection_id.clone();
            }
            self.emit_message(delivered);
        }
    }

    /// Inbound PRESENCE: apply deltas to the map, emitting accepted ones.
    pub fn handle_presence(&mut self, msg: &ProtocolMessage) {
        let deltas = Self::presence_with_defaults(msg);
        for delta in deltas {
            if let Some(event) = self.presence.process(delta) {
                self.emit_presence(event);
            }
        }
    }

    /// Inbound SYNC page. Pages apply in arrival order, each fully processed
    /// before the next; the cursor tail decides completion.
    pub fn handle_sync(&mut self, msg: &ProtocolMessage) {
        if !self.presence.sync_in_progress() {
            self.presence.start_sync();
        }
        let deltas = Self::presence_with_defaults(msg);
        for delta in deltas {
            if let Some(event) = self.presence.process(delta) {
                self.emit_presence(event);
            }
        }
        if is_last_sync_page(msg.channel_serial.as_deref()) {
            let leaves = self.presence.end_sync();
            for leave in leaves {
                self.emit_presence(leave);
            }
            self.resolve_get_waiters();
        }
    }

    /// Fill in per-delta fields the server elides on the envelope.
    fn presence_with_defaults(msg: &ProtocolMessage) -> Vec<PresenceMessage> {
        let Some(list) = &msg.presence else {
            return Vec::new();
        };
        list.iter()
            .enumerate()
            .map(|(i, p)| {
                let mut delta = p.clone();
                delta.data = delta.data.map(|d| decode_data(d, p.encoding.as_deref()));
                delta.encoding = None;
                if delta.id.is_none() {
                    delta.id = msg.id.as_ref().map(|pid| format!("{pid}:{i}"));
                }
                if delta.timestamp.is_none() {
                    delta.timestamp = msg.timestamp;
                }
                if delta.connection_id.is_none() {
                    delta.connection_id = msg.connection_id.clone();
                }
                delta
            })
            .collect()
    }

    /// Presence snapshot requests wait out an in-flight SYNC.
    pub fn resolve_get_waiters(&mut self) {
        if self.state != ChannelState::Attached || self.presence.sync_in_progress() {
            return;
        }
        let snapshot = self.presence.members();
        for waiter in self.get_waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    fn emit_message(&mut self, message: Message) {
        self.message_subs.retain(|(filter, tx)| {
            if let Some(name) = filter {
                if message.name.as_deref() != Some(name.as_str()) {
                    return !tx.is_closed();
                }
            }
            match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(channel = %self.name, "subscriber channel full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(crate) fn emit_presence(&mut self, event: PresenceMessage) {
        self.presence_subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel = %self.name, "presence subscriber full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ChannelCore {
        ChannelCore::new("room".to_string(), 16)
    }

    fn attached_msg(f: i32) -> ProtocolMessage {
        ProtocolMessage {
            action: action::ATTACHED,
            channel: Some("room".to_string()),
            channel_serial: Some("serial-1".to_string()),
            flags: (f != 0).then_some(f),
            ..Default::default()
        }
    }

    #[test]
    fn attach_message_carries_resume_flag_only_with_serial() {
        let mut ch = core();
        let msg = ch.attach_message();
        assert_eq!(msg.action, action::ATTACH);
        assert!(msg.flags.is_none());

        ch.attach_serial = Some("serial-1".to_string());
        let msg = ch.attach_message();
        assert_eq!(msg.channel_serial.as_deref(), Some("serial-1"));
        assert_ne!(msg.flags.unwrap_or(0) & flags::ATTACH_RESUME, 0);
    }

    #[tokio::test]
    async fn attached_flushes_buffered_ops_in_submission_order() {
        let mut ch = core();
        ch.set_state(ChannelState::Attaching, None, false);
        for i in 0..3 {
            let msg = ProtocolMessage {
                action: action::MESSAGE,
                channel: Some("room".to_string()),
                id: Some(format!("op-{i}")),
                ..Default::default()
            };
            ch.buffer_op(msg, None);
        }
        let out = ch.handle_attached(&attached_msg(0));
        let ids: Vec<_> = out
            .iter()
            .map(|(m, _)| m.id.as_deref().unwrap_or(""))
            .collect();
        assert_eq!(ids, vec!["op-0", "op-1", "op-2"]);
        assert_eq!(ch.state, ChannelState::Attached);
    }

    #[tokio::test]
    async fn attach_waiters_resolve_on_attached() {
        let mut ch = core();
        ch.set_state(ChannelState::Attaching, None, false);
        let (tx, rx) = oneshot::channel();
        ch.add_attach_waiter(tx);
        ch.handle_attached(&attached_msg(0));
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn attached_with_presence_flag_starts_sync() {
        let mut ch = core();
        ch.handle_attached(&attached_msg(flags::HAS_PRESENCE));
        assert!(ch.presence.sync_in_progress());
    }

    #[tokio::test]
    async fn attached_without_presence_flag_synthesizes_leaves() {
        let mut ch = core();
        let mut rx = ch.subscribe_presence();
        ch.presence.set_connection_id(Some("me".to_string()));
        ch.presence.process(PresenceMessage {
            id: Some("conn1:1:0".to_string()),
            action: PresenceAction::Enter,
            client_id: Some("alice".to_string()),
            connection_id: Some("conn1".to_string()),
            timestamp: Some(1),
            ..Default::default()
        });
        let _ = rx.try_recv(); // drain the enter event

        ch.handle_attached(&attached_msg(0));
        let leave = rx.try_recv().unwrap();
        assert_eq!(leave.action, PresenceAction::Leave);
        assert_eq!(leave.client_id.as_deref(), Some("alice"));
        assert!(ch.presence.is_empty());
    }

    #[tokio::test]
    async fn resumed_attach_replays_local_members_without_sync() {
        let mut ch = core();
        ch.presence.set_connection_id(Some("me".to_string()));
        ch.presence.process(PresenceMessage {
            id: Some("me:3:0".to_string()),
            action: PresenceAction::Enter,
            client_id: Some("alice".to_string()),
            connection_id: Some("me".to_string()),
            timestamp: Some(1),
            ..Default::default()
        });
        let out = ch.handle_attached(&attached_msg(flags::HAS_CHANNEL_RESUMED));
        assert!(!ch.presence.sync_in_progress());
        assert_eq!(out.len(), 1);
        let (msg, _) = &out[0];
        assert_eq!(msg.action, action::PRESENCE);
        let replay = &msg.presence.as_ref().unwrap()[0];
        assert_eq!(replay.action, PresenceAction::Enter);
        assert_eq!(replay.id.as_deref(), Some("me:3:0"));
    }

    #[tokio::test]
    async fn error_fails_everything_once_and_resets_presence() {
        let mut ch = core();
        ch.set_state(ChannelState::Attaching, None, false);
        let (op_tx, op_rx) = oneshot::channel();
        ch.buffer_op(
            ProtocolMessage {
                action: action::MESSAGE,
                ..Default::default()
            },
            Some(op_tx),
        );
        let (att_tx, att_rx) = oneshot::channel();
        ch.add_attach_waiter(att_tx);
        ch.presence.set_connection_id(Some("me".to_string()));
        ch.presence.process(PresenceMessage {
            id: Some("me:1:0".to_string()),
            action: PresenceAction::Enter,
            client_id: Some("alice".to_string()),
            connection_id: Some("me".to_string()),
            timestamp: Some(1),
            ..Default::default()
        });

        ch.handle_error(ErrorInfo::new(90000, "boom"));
        assert_eq!(ch.state, ChannelState::Failed);
        assert!(ch.presence.is_empty());
        assert!(ch.presence.local_members().is_empty());
        assert_eq!(op_rx.await.unwrap().unwrap_err().code, 90000);
        assert_eq!(att_rx.await.unwrap().unwrap_err().code, 90000);
    }

    #[tokio::test]
    async fn sync_pages_apply_in_order_and_complete_on_empty_cursor() {
        let mut ch = core();
        ch.set_state(ChannelState::Attached, None, false);
        let page = |serial: &str, client: &str, id: &str| ProtocolMessage {
            action: action::SYNC,
            channel: Some("room".to_string()),
            channel_serial: Some(serial.to_string()),
            presence: Some(vec![PresenceMessage {
                id: Some(id.to_string()),
                action: PresenceAction::Present,
                client_id: Some(client.to_string()),
                connection_id: Some(id.split(':').next().unwrap_or("").to_string()),
                timestamp: Some(1),
                ..Default::default()
            }]),
            ..Default::default()
        };
        ch.handle_sync(&page("s:cursor", "alice", "conn1:1:0"));
        assert!(ch.presence.sync_in_progress());
        ch.handle_sync(&page("s:", "bob", "conn2:1:0"));
        assert!(!ch.presence.sync_in_progress());
        assert_eq!(ch.presence.members().len(), 2);
    }

    #[tokio::test]
    async fn get_waiters_resolve_after_sync_completes() {
        let mut ch = core();
        ch.set_state(ChannelState::Attached, None, false);
        ch.presence.start_sync();
        let (tx, mut rx) = oneshot::channel();
        ch.add_get_waiter(tx);
        ch.resolve_get_waiters();
        assert!(rx.try_recv().is_err()); // still syncing

        ch.handle_sync(&ProtocolMessage {
            action: action::SYNC,
            channel: Some("room".to_string()),
            channel_serial: Some("s:".to_string()),
            presence: Some(vec![]),
            ..Default::default()
        });
        let snapshot = rx.try_recv().unwrap().unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn message_delivery_respects_name_filter() {
        let mut ch = core();
        let mut all = ch.subscribe_messages(None);
        let mut only_update = ch.subscribe_messages(Some("update".to_string()));
        ch.handle_message(&ProtocolMessage {
            action: action::MESSAGE,
            channel: Some("room".to_string()),
            id: Some("m1".to_string()),
            timestamp: Some(5),
            messages: Some(vec![
                Message {
                    name: Some("create".to_string()),
                    data: Some(serde_json::json!(1)),
                    ..Default::default()
                },
                Message {
                    name: Some("update".to_string()),
                    data: Some(serde_json::json!(2)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        assert_eq!(all.try_recv().unwrap().name.as_deref(), Some("create"));
        assert_eq!(all.try_recv().unwrap().name.as_deref(), Some("update"));
        let m = only_update.try_recv().unwrap();
        assert_eq!(m.name.as_deref(), Some("update"));
        assert_eq!(m.id.as_deref(), Some("m1:1"));
        assert_eq!(m.timestamp, Some(5));
        assert!(only_update.try_recv().is_err());
    }

    #[tokio::test]
    async fn detached_resets_presence_and_fails_pending() {
        let mut ch = core();
        ch.set_state(ChannelState::Attaching, None, false);
        let (tx, rx) = oneshot::channel();
        ch.buffer_op(
            ProtocolMessage {
                action: action::PRESENCE,
                ..Default::default()
            },
            Some(tx),
        );
        ch.handle_detached(None);
        assert_eq!(ch.state, ChannelState::Detached);
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn suspended_only_degrades_active_states() {
        let mut ch = core();
        ch.handle_suspended(None);
        assert_eq!(ch.state, ChannelState::Initialized);

        ch.set_state(ChannelState::Attached, None, false);
        ch.handle_suspended(None);
        assert_eq!(ch.state, ChannelState::Suspended);
    }
}
