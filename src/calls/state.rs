//! Call session state machine types and termination decision tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::identity::CallId;
use crate::config::LocalIdentity;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media type '{other}'")),
        }
    }
}

/// Which end of the current session this process is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalSide {
    Caller,
    Callee,
}

impl LocalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
        }
    }
}

impl fmt::Display for LocalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a participant, carried explicitly in every message that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Attendee,
    Collaborator,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Attendee => "attendee",
            Self::Collaborator => "collaborator",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "attendee" => Ok(Self::Attendee),
            "collaborator" => Ok(Self::Collaborator),
            other => Err(format!("unknown participant role '{other}'")),
        }
    }
}

/// Why a call ended. Exactly one applies per termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Busy,
    OnAnotherCall,
    NoAnswer,
    InsufficientTokens,
    Cancelled,
    Declined,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::OnAnotherCall => "on_another_call",
            Self::NoAnswer => "no_answer",
            Self::InsufficientTokens => "insufficient_tokens",
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "busy" => Ok(Self::Busy),
            "on_another_call" => Ok(Self::OnAnotherCall),
            "no_answer" => Ok(Self::NoAnswer),
            "insufficient_tokens" => Ok(Self::InsufficientTokens),
            "cancelled" => Ok(Self::Cancelled),
            "declined" => Ok(Self::Declined),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown termination reason '{other}'")),
        }
    }
}

/// Reason sub-field of the `cancel` message, used by the peer for its own
/// reason derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEndReason {
    Cancelled,
    Declined,
    Ended,
}

impl WireEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for WireEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireEndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancelled" => Ok(Self::Cancelled),
            "declined" => Ok(Self::Declined),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown end reason '{other}'")),
        }
    }
}

/// What prompted a local termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndCause {
    /// The user hung up or cancelled.
    #[default]
    User,
    /// The account ran out of call credit.
    InsufficientTokens,
}

/// Lifecycle of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LifecycleState {
    #[default]
    Idle,
    /// Caller: initiate sent, waiting for an answer.
    CallWaiting,
    /// Callee: ringing locally.
    IncomingCall(MediaType),
    /// Accepted, room provisioning in progress.
    CallAccepted,
    /// Room joined, media may flow.
    ConnectedJoined,
    Terminated(TerminationReason),
}

impl LifecycleState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    /// Accepted or connected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::CallAccepted | Self::ConnectedJoined)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::CallWaiting | Self::IncomingCall(_))
    }
}

/// State transitions applied to a session.
#[derive(Debug, Clone, Copy)]
pub enum CallTransition {
    LocalAccepted,
    RemoteAccepted,
    RoomJoined,
    Terminated(TerminationReason),
}

/// The single call session owned by the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: String,
    pub callee_id: String,
    pub caller_role: ParticipantRole,
    pub callee_role: ParticipantRole,
    pub media_type: MediaType,
    pub state: LifecycleState,
    pub local_side: LocalSide,
    pub in_call_or_connecting: bool,
    pub meeting_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new_outgoing(
        call_id: CallId,
        local: &LocalIdentity,
        callee_id: String,
        callee_role: ParticipantRole,
        media_type: MediaType,
    ) -> Self {
        Self {
            call_id,
            caller_id: local.user_id.clone(),
            callee_id,
            caller_role: local.role,
            callee_role,
            media_type,
            state: LifecycleState::CallWaiting,
            local_side: LocalSide::Caller,
            in_call_or_connecting: false,
            meeting_id: None,
            created_at: Utc::now(),
        }
    }

    /// Identity of both parties comes from the inbound message only.
    pub fn new_incoming(
        call_id: CallId,
        caller_id: String,
        caller_role: ParticipantRole,
        callee_id: String,
        callee_role: ParticipantRole,
        media_type: MediaType,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            caller_role,
            callee_role,
            media_type,
            state: LifecycleState::IncomingCall(media_type),
            local_side: LocalSide::Callee,
            in_call_or_connecting: false,
            meeting_id: None,
            created_at: Utc::now(),
        }
    }

    /// The other party of this session.
    pub fn peer_id(&self) -> &str {
        match self.local_side {
            LocalSide::Caller => &self.callee_id,
            LocalSide::Callee => &self.caller_id,
        }
    }

    pub fn is_caller(&self) -> bool {
        self.local_side == LocalSide::Caller
    }

    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (self.local_side, self.state, transition) {
            (LocalSide::Callee, LifecycleState::IncomingCall(_), CallTransition::LocalAccepted) => {
                LifecycleState::CallAccepted
            }
            (LocalSide::Caller, LifecycleState::CallWaiting, CallTransition::RemoteAccepted) => {
                LifecycleState::CallAccepted
            }
            (_, LifecycleState::CallAccepted, CallTransition::RoomJoined) => {
                LifecycleState::ConnectedJoined
            }
            (_, current, CallTransition::Terminated(reason)) if !current.is_terminated() => {
                LifecycleState::Terminated(reason)
            }
            (_, current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };

        self.in_call_or_connecting = new_state.is_active();
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Reason shown locally and reason sent to the peer when this side ends the call.
///
/// Returns `None` when there is nothing to terminate. Side/state pairs that
/// cannot occur in a well-formed session (a caller ringing locally, a callee
/// waiting for an answer) fall back to `cancelled`.
pub fn local_termination(
    side: LocalSide,
    state: LifecycleState,
    cause: EndCause,
) -> Option<(TerminationReason, WireEndReason)> {
    let after_accept = match cause {
        EndCause::User => TerminationReason::Busy,
        EndCause::InsufficientTokens => TerminationReason::InsufficientTokens,
    };

    match (side, state) {
        (_, LifecycleState::Idle | LifecycleState::Terminated(_)) => None,
        (LocalSide::Caller, LifecycleState::CallWaiting) => {
            Some((TerminationReason::Cancelled, WireEndReason::Cancelled))
        }
        (LocalSide::Callee, LifecycleState::IncomingCall(_)) => {
            Some((TerminationReason::Declined, WireEndReason::Declined))
        }
        (_, LifecycleState::CallAccepted | LifecycleState::ConnectedJoined) => {
            Some((after_accept, WireEndReason::Ended))
        }
        (LocalSide::Caller, LifecycleState::IncomingCall(_))
        | (LocalSide::Callee, LifecycleState::CallWaiting) => {
            Some((TerminationReason::Cancelled, WireEndReason::Cancelled))
        }
    }
}

/// Substate shown locally when the peer cancels or ends the call.
///
/// The wire `reason` is informational only; the local role and state decide.
/// A ringing callee reads an unanswered call as `declined`; once it accepted,
/// a cancel before the room is joined reads as `cancelled`.
pub fn remote_cancellation(side: LocalSide, state: LifecycleState) -> Option<TerminationReason> {
    match (side, state) {
        (_, LifecycleState::Idle | LifecycleState::Terminated(_)) => None,
        (LocalSide::Caller, LifecycleState::CallWaiting) => Some(TerminationReason::Cancelled),
        (LocalSide::Caller, LifecycleState::CallAccepted | LifecycleState::ConnectedJoined) => {
            Some(TerminationReason::Busy)
        }
        (LocalSide::Callee, LifecycleState::IncomingCall(_)) => Some(TerminationReason::Declined),
        (LocalSide::Callee, LifecycleState::CallAccepted) => Some(TerminationReason::Cancelled),
        (LocalSide::Callee, LifecycleState::ConnectedJoined) => Some(TerminationReason::Busy),
        (LocalSide::Caller, LifecycleState::IncomingCall(_))
        | (LocalSide::Callee, LifecycleState::CallWaiting) => Some(TerminationReason::Cancelled),
    }
}

/// Substate for a `decline` received by the caller.
pub fn decline_reason(reason: &str) -> TerminationReason {
    match reason.parse::<TerminationReason>() {
        Ok(
            r @ (TerminationReason::Busy
            | TerminationReason::OnAnotherCall
            | TerminationReason::InsufficientTokens),
        ) => r,
        _ => TerminationReason::Declined,
    }
}
