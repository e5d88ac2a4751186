use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::events::{EventEmitter, QueueStatus, SignalEvent, SignalEventListener};
use crate::protocol::{Participant, SignalKind, SignalMessage, now_millis};
use crate::transport::{Transport, TransportEvent};

/// One-to-one room abstraction over a [`Transport`].
///
/// Membership is optimistic: `join_room` records the room locally and
/// sends the control message without waiting for an acknowledgement;
/// the eventual `user-joined`/`error` events are the source of truth.
pub struct SignalingClient<T: Transport> {
    transport: Arc<T>,
    local_id: String,
    emitter: EventEmitter,
    state: Arc<ClientState>,
}

struct ClientState {
    room_id: Mutex<Option<String>>,
    /// Messages replayed after an automatic reconnect, before
    /// `Connected` is surfaced to consumers.
    room_rejoin: Mutex<Option<SignalMessage>>,
    group_rejoin: Mutex<Option<SignalMessage>>,
}

impl<T: Transport> Clone for SignalingClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            local_id: self.local_id.clone(),
            emitter: self.emitter.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Transport> SignalingClient<T> {
    pub fn new(transport: T, local_id: &str) -> Self {
        Self {
            transport: Arc::new(transport),
            local_id: local_id.to_string(),
            emitter: EventEmitter::new(),
            state: Arc::new(ClientState {
                room_id: Mutex::new(None),
                room_rejoin: Mutex::new(None),
                group_rejoin: Mutex::new(None),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> Option<String> {
        lock(&self.state.room_id).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn add_listener(&self, listener: Arc<dyn SignalEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Establish the transport and start the dispatch loop.
    pub async fn connect(&self) -> Result<(), SignalError> {
        self.transport.connect().await?;
        // events emitted before the take are buffered, nothing is lost
        if let Some(rx) = self.transport.take_events() {
            let client = self.clone();
            tokio::spawn(async move {
                client.dispatch_loop(rx).await;
            });
        }
        Ok(())
    }

    /// Idempotent teardown; clears membership and any pending
    /// reconnection state.
    pub async fn disconnect(&self) {
        lock(&self.state.room_id).take();
        lock(&self.state.room_rejoin).take();
        lock(&self.state.group_rejoin).take();
        self.transport.disconnect().await;
    }

    /// Optimistically join a 1:1 room. Joining while already in a room
    /// is an implicit leave-then-join.
    pub fn join_room(&self, room_id: &str) {
        if !self.transport.is_connected() {
            warn!("join_room({}) while disconnected, ignored", room_id);
            return;
        }
        if let Some(previous) = lock(&self.state.room_id).take() {
            info!("leaving room {} before joining {}", previous, room_id);
            self.send_raw(SignalMessage::leave_room(&previous));
        }
        *lock(&self.state.room_id) = Some(room_id.to_string());
        let join = SignalMessage::join_room(room_id);
        *lock(&self.state.room_rejoin) = Some(join.clone());
        self.send_raw(join);
        self.emitter.emit(SignalEvent::QueueStatus(QueueStatus::Waiting));
    }

    /// No-op when not in a room; the second call in a row sends nothing.
    pub fn leave_room(&self) {
        let Some(room_id) = lock(&self.state.room_id).take() else {
            debug!("leave_room with no active room, ignored");
            return;
        };
        lock(&self.state.room_rejoin).take();
        if self.transport.is_connected() {
            self.send_raw(SignalMessage::leave_room(&room_id));
        } else {
            warn!("leave_room({}) while disconnected, local state cleared", room_id);
        }
    }

    pub fn send_offer(&self, offer: Value, to: &str) {
        self.send_negotiation(SignalKind::Offer, offer, to);
    }

    pub fn send_answer(&self, answer: Value, to: &str) {
        self.send_negotiation(SignalKind::Answer, answer, to);
    }

    pub fn send_ice_candidate(&self, candidate: Value, to: &str) {
        self.send_negotiation(SignalKind::IceCandidate, candidate, to);
    }

    /// The payload is an inert blob; only the envelope is ours.
    fn send_negotiation(&self, kind: SignalKind, payload: Value, to: &str) {
        let mut message = SignalMessage::negotiation(kind, payload, to);
        message.room_id = self.room_id();
        self.send_raw(message);
    }

    /// Stamp `from`/`timestamp` and hand off to the transport. Sending
    /// while disconnected is best-effort: a logged warning, never a
    /// panic or an error surfaced to the call UI.
    pub(crate) fn send_raw(&self, mut message: SignalMessage) {
        if message.from.is_none() {
            message.from = Some(self.local_id.clone());
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(now_millis());
        }
        if let Err(e) = self.transport.send(message) {
            warn!("outbound signaling message dropped: {}", e);
        }
    }

    pub(crate) fn set_group_rejoin(&self, message: Option<SignalMessage>) {
        *lock(&self.state.group_rejoin) = message;
    }

    async fn dispatch_loop(&self, rx: async_channel::Receiver<TransportEvent>) {
        while let Ok(event) = rx.recv().await {
            match event {
                TransportEvent::Opened => self.emitter.emit(SignalEvent::Connected),
                TransportEvent::Reopened => {
                    // restore membership before consumers see Connected
                    let room = lock(&self.state.room_rejoin).clone();
                    let group = lock(&self.state.group_rejoin).clone();
                    if let Some(join) = room {
                        info!("re-establishing room membership after reconnect");
                        self.send_raw(join);
                    }
                    if let Some(join) = group {
                        info!("re-establishing group membership after reconnect");
                        self.send_raw(join);
                    }
                    self.emitter.emit(SignalEvent::Connected);
                }
                TransportEvent::Closed => self.emitter.emit(SignalEvent::Disconnected),
                TransportEvent::Reconnecting { attempt } => {
                    self.emitter.emit(SignalEvent::Reconnecting { attempt });
                }
                TransportEvent::GaveUp { reason } => {
                    self.emitter.emit(SignalEvent::Error(reason));
                    self.emitter.emit(SignalEvent::Disconnected);
                }
                TransportEvent::Message(message) => self.dispatch_message(message),
            }
        }
        debug!("signaling dispatch loop ended");
    }

    /// `user-joined`/`user-left`/`error` become dedicated events; every
    /// other type is surfaced raw for the caller (or the group layer)
    /// to interpret.
    pub(crate) fn dispatch_message(&self, message: SignalMessage) {
        match message.kind {
            SignalKind::UserJoined => {
                let Some(id) = message.participant_id.clone().or_else(|| message.from.clone())
                else {
                    warn!("user-joined without a participant id, dropped");
                    return;
                };
                if message.room_id.is_some() && message.room_id == self.room_id() {
                    self.emitter.emit(SignalEvent::QueueStatus(QueueStatus::Matched));
                }
                let participant = message
                    .participant_data
                    .as_ref()
                    .map(Participant::from_update);
                self.emitter.emit(SignalEvent::UserJoined {
                    id,
                    participant,
                    group_id: message.group_id.clone(),
                });
            }
            SignalKind::UserLeft => {
                let Some(id) = message.participant_id.clone().or_else(|| message.from.clone())
                else {
                    warn!("user-left without a participant id, dropped");
                    return;
                };
                self.emitter.emit(SignalEvent::UserLeft {
                    id,
                    group_id: message.group_id.clone(),
                });
            }
            SignalKind::Error => {
                let text = match &message.data {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown signaling error".to_string(),
                };
                self.emitter.emit(SignalEvent::Error(text));
            }
            _ => self.emitter.emit(SignalEvent::Message(message)),
        }
    }
}

fn lock<'a, V>(mutex: &'a Mutex<V>) -> MutexGuard<'a, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedFabric, SimulatedTransport};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn capture(client: &SignalingClient<SimulatedTransport>) -> Arc<StdMutex<Vec<SignalEvent>>> {
        let events: Arc<StdMutex<Vec<SignalEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        client.add_listener(Arc::new(move |event: SignalEvent| {
            sink.lock().unwrap().push(event);
        }));
        events
    }

    fn client_on(fabric: &SimulatedFabric, id: &str) -> SignalingClient<SimulatedTransport> {
        SignalingClient::new(SimulatedTransport::new(fabric, id), id)
    }

    #[tokio::test]
    async fn join_room_emits_waiting_status() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");
        let events = capture(&client);

        client.connect().await.unwrap();
        client.join_room("r1");

        assert_eq!(client.room_id().as_deref(), Some("r1"));
        let captured = events.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| matches!(e, SignalEvent::QueueStatus(QueueStatus::Waiting))));
    }

    #[tokio::test]
    async fn join_room_while_disconnected_is_a_noop() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");

        client.join_room("r1");

        assert!(client.room_id().is_none());
    }

    #[tokio::test]
    async fn user_joined_in_current_room_flips_queue_status() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");
        let events = capture(&client);
        client.connect().await.unwrap();
        client.join_room("r1");

        let mut joined = SignalMessage::user_joined("p2");
        joined.room_id = Some("r1".to_string());
        client.dispatch_message(joined);

        let captured = events.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| matches!(e, SignalEvent::QueueStatus(QueueStatus::Matched))));
        assert!(captured.iter().any(
            |e| matches!(e, SignalEvent::UserJoined { id, .. } if id == "p2")
        ));
    }

    #[tokio::test]
    async fn error_message_surfaces_text() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");
        let events = capture(&client);

        client.dispatch_message(SignalMessage::error("room full"));

        let captured = events.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| matches!(e, SignalEvent::Error(text) if text == "room full")));
    }

    #[tokio::test]
    async fn unhandled_kinds_surface_as_raw_messages() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");
        let events = capture(&client);

        let offer = SignalMessage::negotiation(SignalKind::Offer, json!({"sdp": "x"}), "p1");
        client.dispatch_message(offer);

        let captured = events.lock().unwrap();
        assert!(captured.iter().any(|e| matches!(
            e,
            SignalEvent::Message(msg) if msg.kind == SignalKind::Offer
        )));
    }

    #[tokio::test]
    async fn leave_room_twice_is_idempotent() {
        let fabric = SimulatedFabric::new();
        let client = client_on(&fabric, "p1");
        client.connect().await.unwrap();
        client.join_room("r1");

        client.leave_room();
        assert!(client.room_id().is_none());
        client.leave_room(); // second call: nothing to send, no panic
        assert!(client.room_id().is_none());
    }
}
