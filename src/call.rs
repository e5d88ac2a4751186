use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::events::{SignalEvent, SignalEventListener};
use crate::protocol::ParticipantUpdate;

/// UI-facing call lifecycle.
///
/// `Ended` is terminal: a new call requires a new machine. In
/// particular `Ended` never transitions back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    /// Transport dropped out of an active call; signaling is retrying.
    Reconnecting,
    Ended,
}

type StateCallback = Box<dyn Fn(CallState) + Send + Sync>;

/// Drives call state from signaling events plus local user actions.
///
/// Activation is gated on both the first remote peer and local media
/// readiness; whichever arrives last completes the transition.
pub struct CallMachine {
    inner: Mutex<Inner>,
    on_change: Mutex<Option<StateCallback>>,
}

struct Inner {
    state: CallState,
    peer_present: bool,
    media_ready: bool,
    audio_enabled: bool,
    video_enabled: bool,
    screen_sharing: bool,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CallState::Idle,
                peer_present: false,
                media_ready: false,
                audio_enabled: true,
                video_enabled: true,
                screen_sharing: false,
            }),
            on_change: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CallState {
        self.lock().state
    }

    pub fn on_state_change(&self, callback: impl Fn(CallState) + Send + Sync + 'static) {
        *self
            .on_change
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    /// Local "start/join" action.
    pub fn start(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                CallState::Idle => {
                    inner.state = CallState::Connecting;
                    true
                }
                CallState::Ended => {
                    warn!("start on an ended call ignored; create a new machine");
                    false
                }
                _ => false,
            }
        };
        if changed {
            self.notify(CallState::Connecting);
        }
    }

    /// Local media capture is up (camera/microphone acquired).
    pub fn media_ready(&self) {
        let activated = {
            let mut inner = self.lock();
            inner.media_ready = true;
            inner.try_activate()
        };
        if activated {
            self.notify(CallState::Active);
        }
    }

    pub fn peer_joined(&self) {
        let activated = {
            let mut inner = self.lock();
            inner.peer_present = true;
            inner.try_activate()
        };
        if activated {
            self.notify(CallState::Active);
        }
    }

    pub fn peer_left(&self) {
        self.lock().peer_present = false;
    }

    /// Transport dropped while the call was live: not the end of the
    /// call, the signaling layer is retrying.
    pub fn transport_lost(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                CallState::Active => {
                    inner.state = CallState::Reconnecting;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(CallState::Reconnecting);
        }
    }

    pub fn transport_restored(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                CallState::Reconnecting => {
                    inner.state = CallState::Active;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(CallState::Active);
        }
    }

    /// Reconnection attempts exhausted (or the initial connect failed
    /// fatally): the call is over.
    pub fn reconnect_failed(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                CallState::Connecting | CallState::Reconnecting => {
                    inner.state = CallState::Ended;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(CallState::Ended);
        }
    }

    /// Explicit local hangup; terminal from any live state.
    pub fn hangup(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                CallState::Ended => false,
                _ => {
                    inner.state = CallState::Ended;
                    true
                }
            }
        };
        if changed {
            self.notify(CallState::Ended);
        }
    }

    /// Returns the metadata update to broadcast to the group.
    pub fn set_audio_enabled(&self, enabled: bool) -> ParticipantUpdate {
        self.lock().audio_enabled = enabled;
        debug!("audio enabled: {}", enabled);
        ParticipantUpdate::audio(enabled)
    }

    /// Returns the metadata update to broadcast to the group.
    pub fn set_video_enabled(&self, enabled: bool) -> ParticipantUpdate {
        self.lock().video_enabled = enabled;
        debug!("video enabled: {}", enabled);
        ParticipantUpdate::video(enabled)
    }

    /// Screen share is negotiated peer-to-peer; only the local flag
    /// lives here.
    pub fn set_screen_share(&self, sharing: bool) {
        self.lock().screen_sharing = sharing;
        debug!("screen sharing: {}", sharing);
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.lock().audio_enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.lock().video_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.lock().screen_sharing
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, state: CallState) {
        let callback = self.on_change.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = callback.as_ref() {
            callback(state);
        }
    }
}

impl Inner {
    fn try_activate(&mut self) -> bool {
        if self.state == CallState::Connecting && self.peer_present && self.media_ready {
            self.state = CallState::Active;
            return true;
        }
        false
    }
}

/// Adapts signaling events into call machine inputs, so the machine
/// stays transport-agnostic.
pub struct CallSignalBridge {
    machine: Arc<CallMachine>,
}

impl CallSignalBridge {
    pub fn new(machine: Arc<CallMachine>) -> Self {
        Self { machine }
    }
}

impl SignalEventListener for CallSignalBridge {
    fn on_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::Connected => self.machine.transport_restored(),
            SignalEvent::Reconnecting { .. } => self.machine.transport_lost(),
            SignalEvent::Error(_) => self.machine.reconnect_failed(),
            SignalEvent::UserJoined { .. } | SignalEvent::ParticipantJoined { .. } => {
                self.machine.peer_joined();
            }
            SignalEvent::UserLeft { .. } | SignalEvent::ParticipantLeft { .. } => {
                self.machine.peer_left();
            }
            _ => {}
        }
    }
}
