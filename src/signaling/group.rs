use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::SignalingClient;
use crate::error::SignalError;
use crate::events::{EventEmitter, SignalEvent, SignalEventListener};
use crate::protocol::{Participant, ParticipantUpdate, SignalKind, SignalMessage};
use crate::transport::Transport;

/// Many-to-many group coordination, composed over [`SignalingClient`].
///
/// The base client keeps its one-to-one room behavior; this layer adds
/// a live participant directory, broadcast/targeted relay, and metadata
/// merge semantics. Consumers listen on this client's emitter, which
/// re-emits refined events from the base.
pub struct GroupClient<T: Transport> {
    inner: SignalingClient<T>,
    emitter: EventEmitter,
    state: Arc<GroupState>,
}

struct GroupState {
    group_id: Mutex<Option<String>>,
    /// participant id -> metadata, for every member except ourselves
    participants: Mutex<HashMap<String, Participant>>,
    /// our own metadata, kept current for rejoin-on-reconnect
    local: Mutex<Participant>,
}

impl<T: Transport> GroupClient<T> {
    pub fn new(transport: T, local_id: &str) -> Self {
        Self::from_client(SignalingClient::new(transport, local_id))
    }

    /// Decorate an existing base client. Registers one internal
    /// listener on it; the base stays usable for room operations.
    pub fn from_client(inner: SignalingClient<T>) -> Self {
        let emitter = EventEmitter::new();
        let state = Arc::new(GroupState {
            group_id: Mutex::new(None),
            participants: Mutex::new(HashMap::new()),
            local: Mutex::new(Participant::default()),
        });
        inner.add_listener(Arc::new(GroupForwarder {
            emitter: emitter.clone(),
            state: state.clone(),
        }));
        Self {
            inner,
            emitter,
            state,
        }
    }

    /// Base client, for room operations and negotiation outside groups.
    pub fn client(&self) -> &SignalingClient<T> {
        &self.inner
    }

    pub fn local_id(&self) -> &str {
        self.inner.local_id()
    }

    pub fn group_id(&self) -> Option<String> {
        lock(&self.state.group_id).clone()
    }

    /// Defensive copy; callers cannot mutate the directory.
    pub fn participants(&self) -> HashMap<String, Participant> {
        lock(&self.state.participants).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn SignalEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub async fn connect(&self) -> Result<(), SignalError> {
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        lock(&self.state.group_id).take();
        lock(&self.state.participants).clear();
        self.inner.disconnect().await;
    }

    /// Join a group with our own metadata. Joining while already in a
    /// different group is an implicit leave-then-join.
    pub fn join_group(&self, group_id: &str, participant: Participant) {
        if !self.inner.is_connected() {
            warn!("join_group({}) while disconnected, ignored", group_id);
            return;
        }
        if let Some(previous) = self.group_id() {
            if previous == group_id {
                debug!("already in group {}, join ignored", group_id);
                return;
            }
            info!("leaving group {} before joining {}", previous, group_id);
            self.leave_group();
        }
        *lock(&self.state.group_id) = Some(group_id.to_string());
        *lock(&self.state.local) = participant.clone();
        let join = SignalMessage::join_group(group_id, &participant);
        self.inner.set_group_rejoin(Some(join.clone()));
        self.inner.send_raw(join);
    }

    /// Idempotent: the second call in a row sends nothing.
    pub fn leave_group(&self) {
        let Some(group_id) = lock(&self.state.group_id).take() else {
            debug!("leave_group with no active group, ignored");
            return;
        };
        lock(&self.state.participants).clear();
        self.inner.set_group_rejoin(None);
        if self.inner.is_connected() {
            self.inner.send_raw(SignalMessage::leave_group(&group_id));
        } else {
            warn!("leave_group({}) while disconnected, local state cleared", group_id);
        }
    }

    pub fn send_group_offer(&self, offer: Value, to: &str) {
        self.send_group_negotiation(SignalKind::Offer, offer, to);
    }

    pub fn send_group_answer(&self, answer: Value, to: &str) {
        self.send_group_negotiation(SignalKind::Answer, answer, to);
    }

    pub fn send_group_ice_candidate(&self, candidate: Value, to: &str) {
        self.send_group_negotiation(SignalKind::IceCandidate, candidate, to);
    }

    /// With no current group there is nothing to address: silent no-op.
    fn send_group_negotiation(&self, kind: SignalKind, payload: Value, to: &str) {
        let Some(group_id) = self.group_id() else {
            debug!("group negotiation send with no active group, ignored");
            return;
        };
        let mut message = SignalMessage::negotiation(kind, payload, to);
        message.group_id = Some(group_id);
        self.inner.send_raw(message);
    }

    /// Broadcast a partial metadata update. Receivers shallow-merge it
    /// into their record of us; our own copy is updated too so a rejoin
    /// after reconnect announces current flags.
    pub fn send_participant_update(&self, update: ParticipantUpdate) {
        let Some(group_id) = self.group_id() else {
            debug!("participant update with no active group, ignored");
            return;
        };
        {
            let mut local = lock(&self.state.local);
            local.apply(&update);
            self.inner
                .set_group_rejoin(Some(SignalMessage::join_group(&group_id, &local)));
        }
        let mut message = SignalMessage::participant_update(update);
        message.group_id = Some(group_id);
        self.inner.send_raw(message);
    }

    /// Broadcast an application-level payload to every other member.
    pub fn send_group_message(&self, payload: Value) {
        let Some(group_id) = self.group_id() else {
            debug!("group message with no active group, ignored");
            return;
        };
        let mut message = SignalMessage::group_message(payload);
        message.group_id = Some(group_id);
        self.inner.send_raw(message);
    }
}

/// Internal listener on the base client: maintains the directory and
/// re-emits refined events on the group emitter.
struct GroupForwarder {
    emitter: EventEmitter,
    state: Arc<GroupState>,
}

impl GroupForwarder {
    fn current_group(&self) -> Option<String> {
        lock(&self.state.group_id).clone()
    }

    /// true when the event's scope matches our group (or has none)
    fn in_scope(&self, group_id: &Option<String>) -> bool {
        match group_id {
            None => true,
            Some(gid) => self.current_group().as_deref() == Some(gid.as_str()),
        }
    }

    fn handle_raw(&self, message: SignalMessage) {
        match message.kind {
            SignalKind::ParticipantUpdate => {
                if !self.in_scope(&message.group_id) {
                    debug!("participant-update for a different group, dropped");
                    return;
                }
                let (Some(from), Some(update)) =
                    (message.from.clone(), message.participant_data.clone())
                else {
                    warn!("participant-update without sender or payload, dropped");
                    return;
                };
                // updates for unknown participants are dropped, not
                // inserted: stale events must not create ghost entries
                let merged = {
                    let mut participants = lock(&self.state.participants);
                    match participants.get_mut(&from) {
                        Some(record) => {
                            record.apply(&update);
                            Some(record.clone())
                        }
                        None => None,
                    }
                };
                match merged {
                    Some(participant) => self.emitter.emit(SignalEvent::ParticipantUpdated {
                        id: from,
                        participant,
                    }),
                    None => debug!("participant-update for unknown {}, dropped", from),
                }
            }
            SignalKind::GroupMessage => {
                if !self.in_scope(&message.group_id) {
                    debug!("group-message for a different group, dropped");
                    return;
                }
                let Some(from) = message.from.clone() else {
                    warn!("group-message without a sender, dropped");
                    return;
                };
                self.emitter.emit(SignalEvent::GroupMessage {
                    from,
                    payload: message.data.clone().unwrap_or(Value::Null),
                });
            }
            _ => self.emitter.emit(SignalEvent::Message(message)),
        }
    }
}

impl SignalEventListener for GroupForwarder {
    fn on_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::UserJoined {
                id,
                participant,
                group_id,
            } => {
                if !self.in_scope(&group_id) {
                    debug!("user-joined for a different group, dropped");
                    return;
                }
                self.emitter.emit(SignalEvent::UserJoined {
                    id: id.clone(),
                    participant: participant.clone(),
                    group_id: group_id.clone(),
                });
                if group_id.is_none() {
                    return; // room-scoped, no directory entry
                }
                let record = participant.unwrap_or_default();
                let inserted = {
                    let mut participants = lock(&self.state.participants);
                    match participants.contains_key(&id) {
                        true => false,
                        false => {
                            participants.insert(id.clone(), record.clone());
                            true
                        }
                    }
                };
                if inserted {
                    self.emitter.emit(SignalEvent::ParticipantJoined {
                        id,
                        participant: record,
                    });
                }
            }
            SignalEvent::UserLeft { id, group_id } => {
                if !self.in_scope(&group_id) {
                    debug!("user-left for a different group, dropped");
                    return;
                }
                self.emitter.emit(SignalEvent::UserLeft {
                    id: id.clone(),
                    group_id: group_id.clone(),
                });
                if group_id.is_none() {
                    return;
                }
                let removed = lock(&self.state.participants).remove(&id).is_some();
                if removed {
                    self.emitter.emit(SignalEvent::ParticipantLeft { id });
                }
            }
            SignalEvent::Message(message) => self.handle_raw(message),
            other => self.emitter.emit(other),
        }
    }
}

fn lock<'a, V>(mutex: &'a Mutex<V>) -> MutexGuard<'a, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
