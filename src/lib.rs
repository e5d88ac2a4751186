//! Real-time signaling and multi-party session coordination.
//!
//! Participants discover each other through 1:1 rooms or many-party
//! groups and exchange opaque session-negotiation payloads (offers,
//! answers, connectivity candidates) over a pluggable transport: a
//! WebSocket relay for production, an in-process simulated fabric for
//! deterministic tests.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod signaling;
pub mod transport;

pub use call::{CallMachine, CallSignalBridge, CallState};
pub use config::{SignalingConfig, TransportMode};
pub use error::SignalError;
pub use events::{EventEmitter, QueueStatus, SignalEvent, SignalEventListener};
pub use protocol::{Participant, ParticipantUpdate, SignalKind, SignalMessage, local_peer_id};
pub use signaling::{GroupClient, SignalingClient};
pub use transport::{
    SimulatedFabric, SimulatedTransport, Transport, TransportEvent, WebSocketTransport,
};
