use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::TransportEvent;
use crate::error::SignalError;
use crate::protocol::{Participant, SignalKind, SignalMessage};

/// Simulated per-hop latency bounds, in milliseconds.
const JITTER_MIN_MS: u64 = 2;
const JITTER_MAX_MS: u64 = 20;

/// In-process relay authority shared by a set of simulated transports.
///
/// Constructible arena: tests create isolated fabrics instead of
/// sharing process-wide state. All registry mutation for one logical
/// step (join, leave, relay) happens under a single lock acquisition,
/// so no partial membership state is ever observable.
#[derive(Clone, Default)]
pub struct SimulatedFabric {
    state: Arc<Mutex<FabricState>>,
}

#[derive(Default)]
struct FabricState {
    /// Registration order decides 1:1 pairing precedence.
    instances: Vec<Instance>,
    /// group id -> member ids in join order
    groups: HashMap<String, Vec<String>>,
}

struct Instance {
    id: String,
    inbox: async_channel::Sender<SignalMessage>,
    room: Option<RoomSlot>,
    group: Option<String>,
    participant: Participant,
}

struct RoomSlot {
    id: String,
    partner: Option<String>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Member ids currently in a group, empty when the group is gone.
    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        let state = self.lock();
        state.groups.get(group_id).cloned().unwrap_or_default()
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.lock().groups.contains_key(group_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: &str, inbox: async_channel::Sender<SignalMessage>) {
        let mut state = self.lock();
        if let Some(pos) = state.instances.iter().position(|i| i.id == id) {
            warn!("instance {} re-registered, dropping previous entry", id);
            state.detach(pos);
            state.instances.remove(pos);
        }
        state.instances.push(Instance {
            id: id.to_string(),
            inbox,
            room: None,
            group: None,
            participant: Participant::default(),
        });
        info!("instance {} registered with fabric", id);
    }

    fn deregister(&self, id: &str) {
        let mut state = self.lock();
        if let Some(pos) = state.instances.iter().position(|i| i.id == id) {
            state.detach(pos);
            state.instances.remove(pos);
            info!("instance {} deregistered from fabric", id);
        }
    }

    /// Entry point for everything a transport sends. The fabric is the
    /// authority: it stamps `from` before any delivery.
    fn handle_send(&self, sender: &str, mut message: SignalMessage) {
        message.from = Some(sender.to_string());

        let mut state = self.lock();
        match message.kind {
            SignalKind::JoinRoom => {
                let Some(room_id) = message.room_id.clone() else {
                    debug!("join-room from {} without roomId, ignored", sender);
                    return;
                };
                state.join_room(sender, &room_id);
            }
            SignalKind::LeaveRoom => state.leave_room(sender),
            SignalKind::JoinGroup => {
                let Some(group_id) = message.group_id.clone() else {
                    debug!("join-group from {} without groupId, ignored", sender);
                    return;
                };
                let participant = message
                    .participant_data
                    .as_ref()
                    .map(Participant::from_update)
                    .unwrap_or_default();
                state.join_group(sender, &group_id, participant);
            }
            SignalKind::LeaveGroup => state.leave_group(sender),
            _ => state.relay(sender, message),
        }
    }
}

impl FabricState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == id)
    }

    fn deliver(&self, id: &str, message: SignalMessage) {
        if let Some(pos) = self.index_of(id) {
            if self.instances[pos].inbox.try_send(message).is_err() {
                debug!("inbox for {} closed, dropping message", id);
            }
        }
    }

    /// Clear memberships at `pos` with departure notifications, without
    /// removing the instance itself.
    fn detach(&mut self, pos: usize) {
        let id = self.instances[pos].id.clone();
        self.leave_room(&id);
        self.leave_group(&id);
    }

    fn join_room(&mut self, sender: &str, room_id: &str) {
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        // a second join while paired is a move: the old room dissolves
        if self.instances[pos].room.is_some() {
            self.leave_room(sender);
        }
        self.instances[pos].room = Some(RoomSlot {
            id: room_id.to_string(),
            partner: None,
        });

        // first-come-first-served: earliest registered instance waiting
        // on this room id with no partner wins
        let candidate = self.instances.iter().position(|i| {
            i.id != sender
                && i.room
                    .as_ref()
                    .is_some_and(|slot| slot.id == room_id && slot.partner.is_none())
        });
        let Some(other_pos) = candidate else {
            debug!("{} waiting in room {} for a partner", sender, room_id);
            return;
        };

        let other = self.instances[other_pos].id.clone();
        if let Some(slot) = self.instances[other_pos].room.as_mut() {
            slot.partner = Some(sender.to_string());
        }
        if let Some(pos) = self.index_of(sender) {
            if let Some(slot) = self.instances[pos].room.as_mut() {
                slot.partner = Some(other.clone());
            }
        }
        info!("paired {} with {} in room {}", sender, other, room_id);

        let mut to_sender = SignalMessage::user_joined(&other);
        to_sender.room_id = Some(room_id.to_string());
        to_sender.from = Some(other.clone());
        self.deliver(sender, to_sender);

        let mut to_other = SignalMessage::user_joined(sender);
        to_other.room_id = Some(room_id.to_string());
        to_other.from = Some(sender.to_string());
        self.deliver(&other, to_other);
    }

    fn leave_room(&mut self, sender: &str) {
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        let Some(slot) = self.instances[pos].room.take() else {
            return;
        };
        let Some(partner) = slot.partner else {
            return;
        };
        // partner departure destroys the room for the remaining side too
        if let Some(partner_pos) = self.index_of(&partner) {
            self.instances[partner_pos].room = None;
        }
        let mut notice = SignalMessage::user_left(sender);
        notice.room_id = Some(slot.id);
        notice.from = Some(sender.to_string());
        self.deliver(&partner, notice);
    }

    fn join_group(&mut self, sender: &str, group_id: &str, participant: Participant) {
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        if self.instances[pos].group.is_some() {
            self.leave_group(sender);
        }
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        self.instances[pos].participant = participant.clone();
        self.instances[pos].group = Some(group_id.to_string());

        let existing = self
            .groups
            .get(group_id)
            .cloned()
            .unwrap_or_default();

        // announce the joiner to every current member, and symmetrically
        // tell the joiner about each pre-existing member
        for member in &existing {
            let mut announce = SignalMessage::user_joined(sender);
            announce.group_id = Some(group_id.to_string());
            announce.participant_data = Some(participant.to_update());
            announce.from = Some(sender.to_string());
            self.deliver(member, announce);

            let member_data = self
                .index_of(member)
                .map(|p| self.instances[p].participant.to_update());
            let mut catch_up = SignalMessage::user_joined(member);
            catch_up.group_id = Some(group_id.to_string());
            catch_up.participant_data = member_data;
            catch_up.from = Some(member.clone());
            self.deliver(sender, catch_up);
        }

        self.groups
            .entry(group_id.to_string())
            .or_default()
            .push(sender.to_string());
        info!(
            "{} joined group {} ({} members)",
            sender,
            group_id,
            existing.len() + 1
        );
    }

    fn leave_group(&mut self, sender: &str) {
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        let Some(group_id) = self.instances[pos].group.take() else {
            return;
        };
        let remaining: Vec<String> = {
            let members = self.groups.entry(group_id.clone()).or_default();
            members.retain(|m| m != sender);
            members.clone()
        };
        for member in &remaining {
            let mut notice = SignalMessage::user_left(sender);
            notice.group_id = Some(group_id.clone());
            notice.from = Some(sender.to_string());
            self.deliver(member, notice);
        }
        if remaining.is_empty() {
            self.groups.remove(&group_id);
            info!("group {} removed (empty)", group_id);
        }
    }

    /// Non-control messages: targeted delivery when `to` is set, fan-out
    /// to every other room/group member otherwise. Never to the sender.
    fn relay(&self, sender: &str, message: SignalMessage) {
        let Some(pos) = self.index_of(sender) else {
            return;
        };
        let peers = self.peers_of(pos);

        match message.to.clone() {
            Some(target) => {
                if peers.iter().any(|p| p == &target) {
                    self.deliver(&target, message);
                } else {
                    debug!(
                        "{} -> {}: target not in sender's room/group, dropped",
                        sender, target
                    );
                }
            }
            None => {
                for peer in &peers {
                    self.deliver(peer, message.clone());
                }
            }
        }
    }

    fn peers_of(&self, pos: usize) -> Vec<String> {
        let instance = &self.instances[pos];
        let mut peers = Vec::new();
        if let Some(slot) = &instance.room {
            if let Some(partner) = &slot.partner {
                peers.push(partner.clone());
            }
        }
        if let Some(group_id) = &instance.group {
            if let Some(members) = self.groups.get(group_id) {
                for member in members {
                    if member != &instance.id && !peers.contains(member) {
                        peers.push(member.clone());
                    }
                }
            }
        }
        peers
    }
}

/// Transport backed by a [`SimulatedFabric`] instead of a network.
///
/// Deliveries are queued per destination and forwarded after a small
/// random delay, so jitter never reorders messages bound for the same
/// target.
pub struct SimulatedTransport {
    fabric: SimulatedFabric,
    local_id: String,
    connected: Arc<AtomicBool>,
    events_tx: async_channel::Sender<TransportEvent>,
    events_rx: Mutex<Option<async_channel::Receiver<TransportEvent>>>,
}

impl SimulatedTransport {
    pub fn new(fabric: &SimulatedFabric, local_id: &str) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            fabric: fabric.clone(),
            local_id: local_id.to_string(),
            connected: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl super::Transport for SimulatedTransport {
    async fn connect(&self) -> Result<(), SignalError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (inbox_tx, inbox_rx) = async_channel::unbounded::<SignalMessage>();
        self.fabric.register(&self.local_id, inbox_tx);

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Ok(message) = inbox_rx.recv().await {
                let jitter = {
                    let mut rng = rand::rng();
                    rng.random_range(JITTER_MIN_MS..=JITTER_MAX_MS)
                };
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                if events_tx.send(TransportEvent::Message(message)).await.is_err() {
                    break;
                }
            }
        });

        let _ = self.events_tx.send(TransportEvent::Opened).await;
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        // dropping the fabric entry closes the inbox and ends delivery
        self.fabric.deregister(&self.local_id);
        let _ = self.events_tx.send(TransportEvent::Closed).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        if !self.is_connected() {
            return Err(SignalError::NotConnected);
        }
        self.fabric.handle_send(&self.local_id, message);
        Ok(())
    }

    fn take_events(&self) -> Option<async_channel::Receiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}
