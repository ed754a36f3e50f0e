//! Lifecycle notifications for the presentation layer.

use log::{debug, trace};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::identity::CallId;
use super::state::{CallSession, LocalSide, MediaType, TerminationReason};
use crate::provisioning::RoomGrant;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    CallWaiting,
    IncomingAudioCall,
    IncomingVideoCall,
    CallAccepted,
    ConnectedJoined,
    Terminated,
    /// Another device of this user picked the call up.
    Idle,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallWaiting => "callWaiting",
            Self::IncomingAudioCall => "incomingAudioCall",
            Self::IncomingVideoCall => "incomingVideoCall",
            Self::CallAccepted => "callAccepted",
            Self::ConnectedJoined => "connectedJoined",
            Self::Terminated => "terminated",
            Self::Idle => "idle",
        }
    }

    pub fn incoming(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Audio => Self::IncomingAudioCall,
            MediaType::Video => Self::IncomingVideoCall,
        }
    }
}

/// `<role>:<phase>`, e.g. `callee:incomingVideoCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LifecycleEvent {
    pub side: LocalSide,
    pub phase: Phase,
}

impl LifecycleEvent {
    pub fn new(side: LocalSide, phase: Phase) -> Self {
        Self { side, phase }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.side, self.phase.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Substate {
    None,
    Reason(TerminationReason),
}

impl fmt::Display for Substate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Reason(reason) => f.write_str(reason.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub call_id: Option<CallId>,
    pub caller_id: Option<String>,
    pub callee_id: Option<String>,
    pub media_type: Option<MediaType>,
    /// Failure description for `terminated(error)`.
    pub message: Option<String>,
    /// Joinable room credentials for `connectedJoined`.
    pub room: Option<RoomGrant>,
}

impl NotificationPayload {
    pub fn for_session(session: &CallSession) -> Self {
        Self {
            call_id: Some(session.call_id.clone()),
            caller_id: Some(session.caller_id.clone()),
            callee_id: Some(session.callee_id.clone()),
            media_type: Some(session.media_type),
            message: None,
            room: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_room(mut self, room: RoomGrant) -> Self {
        self.room = Some(room);
        self
    }
}

/// A `(state, substate, payload)` triple emitted once per transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub state: LifecycleEvent,
    pub substate: Substate,
    pub payload: NotificationPayload,
}

/// The dedup key of the last emitted notification.
struct LastEmitted {
    state: LifecycleEvent,
    substate: Substate,
    call_id: Option<CallId>,
    at: Instant,
}

/// Publishes notifications and drops identical ones for the same call that
/// follow each other within the dedup window.
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    window: Duration,
    last: Option<LastEmitted>,
}

impl Notifier {
    pub fn new(window: Duration) -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            window,
            last: None,
        }
    }

    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Returns false when the notification was suppressed as a duplicate.
    pub fn emit(
        &mut self,
        state: LifecycleEvent,
        substate: Substate,
        payload: NotificationPayload,
    ) -> bool {
        let now = Instant::now();
        if let Some(last) = &self.last
            && last.state == state
            && last.substate == substate
            && last.call_id == payload.call_id
            && now.duration_since(last.at) < self.window
        {
            trace!(target: "Calls/Notify", "Suppressed duplicate {state} ({substate})");
            return false;
        }
        self.last = Some(LastEmitted {
            state,
            substate,
            call_id: payload.call_id.clone(),
            at: now,
        });

        debug!(target: "Calls/Notify", "{state} ({substate})");
        // No subscribers is fine; nothing is rendering.
        let _ = self.tx.send(Notification {
            state,
            substate,
            payload,
        });
        true
    }
}
