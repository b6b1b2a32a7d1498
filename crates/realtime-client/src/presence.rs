//! Per-channel presence membership reconciliation.
//!
//! The map applies an ordered stream of presence deltas plus a paginated
//! bulk SYNC, resolving duplicates and conflicts deterministically via the
//! newness comparison, so the final membership is independent of delivery
//! order for deltas about the same member.

use std::collections::HashMap;

use crate::protocol::{PresenceAction, PresenceMessage};

/// Composite message id `connectionId:msgSerial:index`, parsed once at
/// ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemberId {
    pub connection_id: String,
    pub msg_serial: i64,
    pub index: i64,
}

impl MemberId {
    pub fn parse(id: &str) -> Option<MemberId> {
        let (rest, index) = id.rsplit_once(':')?;
        let (connection_id, msg_serial) = rest.rsplit_once(':')?;
        if connection_id.is_empty() {
            return None;
        }
        Some(MemberId {
            connection_id: connection_id.to_string(),
            msg_serial: msg_serial.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

/// The parsed id, provided it has the expected shape *and* its connectionId
/// matches the message's own. Anything else (server-synthesized leaves,
/// foreign ids) falls back to timestamp comparison.
fn conforming_id(msg: &PresenceMessage) -> Option<MemberId> {
    let id = MemberId::parse(msg.id.as_deref()?)?;
    if Some(id.connection_id.as_str()) == msg.connection_id.as_deref() {
        Some(id)
    } else {
        None
    }
}

/// Strict total order deciding whether `incoming` displaces `existing` for
/// the same member key.
///
/// When both ids conform, (msgSerial, index) decides. Otherwise only a
/// strictly greater timestamp wins; an equal or lesser timestamp rejects the
/// incoming message, so re-applying an already-applied delta is a no-op.
pub(crate) fn is_newer(incoming: &PresenceMessage, existing: &PresenceMessage) -> bool {
    match (conforming_id(incoming), conforming_id(existing)) {
        (Some(a), Some(b)) => (a.msg_serial, a.index) > (b.msg_serial, b.index),
        _ => match (incoming.timestamp, existing.timestamp) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            (None, _) => false,
        },
    }
}

/// SYNC pagination cursor embedded in the channelSerial: `<serial>:<cursor>`.
/// An empty (or absent) cursor tail signals the final page.
pub(crate) fn is_last_sync_page(channel_serial: Option<&str>) -> bool {
    match channel_serial.and_then(|s| s.split_once(':')) {
        Some((_, cursor)) => cursor.is_empty(),
        None => true,
    }
}

/// Consistent per-channel membership snapshot.
///
/// Members are keyed by `connectionId:clientId`. Local members (those entered
/// over this connection) are tracked separately, keyed by clientId, so they
/// can be replayed verbatim after a resume.
pub(crate) struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    local: HashMap<String, PresenceMessage>,
    /// Our connection id; set on CONNECTED, identifies local members.
    connection_id: Option<String>,
    sync_in_progress: bool,
    /// Pre-SYNC membership; entries re-affirmed by the SYNC are struck out,
    /// leftovers are synthesized as LEAVE when the SYNC completes.
    before_sync: Option<HashMap<String, PresenceMessage>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        PresenceMap {
            members: HashMap::new(),
            local: HashMap::new(),
            connection_id: None,
            sync_in_progress: false,
            before_sync: None,
        }
    }

    pub fn set_connection_id(&mut self, connection_id: Option<String>) {
        self.connection_id = connection_id;
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Live members (ABSENT tombstones excluded).
    pub fn members(&self) -> Vec<PresenceMessage> {
        self.members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .cloned()
            .collect()
    }

    /// Members entered over this connection, with their original message ids.
    pub fn local_members(&self) -> Vec<PresenceMessage> {
        self.local.values().cloned().collect()
    }

    /// Apply one delta. Returns the event to emit to subscribers (carrying
    /// the original action) when the delta passed the newness check.
    pub fn process(&mut self, msg: PresenceMessage) -> Option<PresenceMessage> {
        self.track_local(&msg);

        let key = msg.member_key();
        let updated = match msg.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                if let Some(before) = self.before_sync.as_mut() {
                    before.remove(&key);
                }
                // Replayed state must not re-emit "just entered" semantics.
                let mut stored = msg.clone();
                stored.action = PresenceAction::Present;
                self.add_member(key, stored)
            }
            PresenceAction::Leave => {
                if self.sync_in_progress {
                    // Tombstone so a later SYNC page cannot resurrect an
                    // already-left member.
                    let mut stored = msg.clone();
                    stored.action = PresenceAction::Absent;
                    self.add_member(key, stored)
                } else {
                    self.remove_member(&key, &msg)
                }
            }
            PresenceAction::Absent => false,
        };

        if updated {
            Some(msg)
        } else {
            tracing::debug!(member = %msg.member_key(), "stale presence delta ignored");
            None
        }
    }

    fn track_local(&mut self, msg: &PresenceMessage) {
        if self.connection_id.is_none() || msg.connection_id != self.connection_id {
            return;
        }
        let Some(client_id) = msg.client_id.clone() else {
            return;
        };
        match msg.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                if let Some(existing) = self.local.get(&client_id) {
                    if !is_newer(msg, existing) {
                        return;
                    }
                }
                let mut stored = msg.clone();
                stored.action = PresenceAction::Present;
                self.local.insert(client_id, stored);
            }
            PresenceAction::Leave => {
                // A synthesized (non-conforming-id) leave is the server
                // reconciling others' views; our own entry survives it.
                if conforming_id(msg).is_none() {
                    return;
                }
                if let Some(existing) = self.local.get(&client_id) {
                    if is_newer(msg, existing) {
                        self.local.remove(&client_id);
                    }
                }
            }
            PresenceAction::Absent => {}
        }
    }

    fn add_member(&mut self, key: String, stored: PresenceMessage) -> bool {
        if let Some(existing) = self.members.get(&key) {
            if !is_newer(&stored, existing) {
                return false;
            }
        }
        self.members.insert(key, stored);
        true
    }

    fn remove_member(&mut self, key: &str, msg: &PresenceMessage) -> bool {
        if let Some(existing) = self.members.get(key) {
            if is_newer(msg, existing) {
                let was_tombstone = existing.action == PresenceAction::Absent;
                self.members.remove(key);
                return !was_tombstone;
            }
        }
        false
    }

    /// Begin a server-driven SYNC, snapshotting the current membership.
    /// Idempotent while a sync is already running.
    pub fn start_sync(&mut self) {
        if self.sync_in_progress {
            return;
        }
        tracing::debug!("presence sync started");
        self.before_sync = Some(self.members.clone());
        self.sync_in_progress = true;
    }

    /// Complete the SYNC: purge tombstones and synthesize a LEAVE for every
    /// pre-SYNC member the sync did not re-affirm. Returns the synthesized
    /// leave events to emit.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        self.members
            .retain(|_, m| m.action != PresenceAction::Absent);

        let mut leaves = Vec::new();
        if let Some(before) = self.before_sync.take() {
            for (key, member) in before {
                self.members.remove(&key);
                let mut leave = member;
                leave.action = PresenceAction::Leave;
                leave.id = None;
                leave.timestamp = Some(crate::auth::now_ms());
                leaves.push(leave);
            }
        }
        self.sync_in_progress = false;
        tracing::debug!(synthesized_leaves = leaves.len(), "presence sync ended");
        leaves
    }

    /// Clear everything, local members included, with no synthetic leave
    /// events. Used on channel FAILED/DETACHED.
    pub fn reset(&mut self) {
        self.members.clear();
        self.local.clear();
        self.before_sync = None;
        self.sync_in_progress = false;
    }
}
