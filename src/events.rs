use std::sync::Arc;

use serde_json::Value;

use crate::protocol::{Participant, SignalMessage};

/// Events surfaced to consumers of the signaling layer.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Room/group peer became visible; `group_id` is set for
    /// group-scoped events so the group layer can route them
    UserJoined {
        id: String,
        participant: Option<Participant>,
        group_id: Option<String>,
    },
    UserLeft {
        id: String,
        group_id: Option<String>,
    },
    /// Directory-level events emitted by the group service
    ParticipantJoined { id: String, participant: Participant },
    ParticipantLeft { id: String },
    ParticipantUpdated { id: String, participant: Participant },
    /// Raw passthrough for message types the service does not interpret
    Message(SignalMessage),
    GroupMessage { from: String, payload: Value },
    QueueStatus(QueueStatus),
    Error(String),
}

/// 1:1 pairing progress, derived locally (there is no wire type for it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Waiting,
    Matched,
}

/// Trait for receiving events from the signaling layer.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SignalEventListener: Send + Sync {
    fn on_event(&self, event: SignalEvent);
}

impl<F> SignalEventListener for F
where
    F: Fn(SignalEvent) + Send + Sync,
{
    fn on_event(&self, event: SignalEvent) {
        self(event)
    }
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn SignalEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn SignalEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: SignalEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl SignalEventListener for CountingListener {
        fn on_event(&self, _event: SignalEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_listener() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.add_listener(Arc::new(CountingListener {
            count: count.clone(),
        }));

        emitter.emit(SignalEvent::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener {
            count: count1.clone(),
        }));
        emitter.add_listener(Arc::new(CountingListener {
            count: count2.clone(),
        }));

        emitter.emit(SignalEvent::Disconnected);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitter_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let events: Arc<Mutex<Vec<SignalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        emitter.add_listener(Arc::new(move |event: SignalEvent| {
            sink.lock().unwrap().push(event);
        }));

        emitter.emit(SignalEvent::UserLeft {
            id: "p1".to_string(),
            group_id: None,
        });

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            SignalEvent::UserLeft { id, .. } => assert_eq!(id, "p1"),
            other => panic!("expected UserLeft, got {other:?}"),
        }
    }
}
