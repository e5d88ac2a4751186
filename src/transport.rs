//! Transport seam: the capability surface the signaling services are
//! parameterized over, plus the two implementations.

mod sim;
mod ws;

use std::future::Future;

use crate::error::SignalError;
use crate::protocol::SignalMessage;

pub use sim::{SimulatedFabric, SimulatedTransport};
pub use ws::WebSocketTransport;

/// Events a transport surfaces to the signaling client that owns it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Channel established for the first time (or after an explicit
    /// reconnect requested by the caller).
    Opened,
    /// Automatic reconnection succeeded. The client replays its
    /// membership before surfacing `Connected` to consumers.
    Reopened,
    /// Orderly local close.
    Closed,
    /// A retry is scheduled; `attempt` is 1-based.
    Reconnecting { attempt: u32 },
    /// Attempt cap reached; no further retry will be scheduled.
    GaveUp { reason: String },
    Message(SignalMessage),
}

/// Duplex channel to a relay authority (networked or simulated).
///
/// Sends are non-blocking enqueues and never await acknowledgement;
/// `connect` is the only suspending operation.
pub trait Transport: Send + Sync + 'static {
    /// Establish the channel; resolves on readiness.
    fn connect(&self) -> impl Future<Output = Result<(), SignalError>> + Send;

    /// Idempotent close. Cancels any pending reconnection timer.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Enqueue an outbound message. Fails when the channel is down;
    /// the client layer downgrades that to a logged warning.
    fn send(&self, message: SignalMessage) -> Result<(), SignalError>;

    /// Take the inbound event stream. Yields `None` after the first
    /// call; there is exactly one consumer (the client dispatch loop).
    fn take_events(&self) -> Option<async_channel::Receiver<TransportEvent>>;
}
