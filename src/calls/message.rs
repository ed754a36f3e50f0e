//! Wire envelope for signaling messages, typed views of inbound messages and
//! builders for outbound ones.

use serde::{Deserialize, Serialize};

use super::error::CallError;
use super::identity::CallId;
use super::signaling::SignalFlag;
use super::state::{CallSession, MediaType, ParticipantRole, WireEndReason};

/// A signaling message as exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    pub flag: SignalFlag,
    pub payload: SignalPayload,
}

/// Flat payload; which fields are required depends on the flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignalPayload {
    /// Looks a field up by its wire name. Empty strings count as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "to" => &self.to,
            "callId" => &self.call_id,
            "callType" => &self.call_type,
            "mediaType" => &self.media_type,
            "callerId" => &self.caller_id,
            "calleeId" => &self.callee_id,
            "role" => &self.role,
            "callerRole" => &self.caller_role,
            "calleeRole" => &self.callee_role,
            "reason" => &self.reason,
            "meetingId" => &self.meeting_id,
            "message" => &self.message,
            _ => return None,
        };
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, CallError> {
        self.field(name)
            .map(str::to_string)
            .ok_or(CallError::MissingField(name))
    }
}

/// Sender and recipient identities plus the call they refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct Parties {
    pub to: String,
    pub caller_id: String,
    pub callee_id: String,
    pub call_id: CallId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiateSignal {
    pub parties: Parties,
    pub media_type: MediaType,
    pub caller_role: ParticipantRole,
    pub callee_role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeetingReadySignal {
    pub parties: Parties,
    pub meeting_id: String,
    pub caller_role: ParticipantRole,
    pub callee_role: ParticipantRole,
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Initiate(InitiateSignal),
    Accept(Parties),
    Decline {
        parties: Parties,
        reason: String,
    },
    Cancel {
        parties: Parties,
        reason: WireEndReason,
    },
    Timeout(Parties),
    SelfStopRing {
        to: String,
        callee_id: String,
        call_id: CallId,
    },
    MeetingReady(MeetingReadySignal),
    MeetingProblem {
        parties: Parties,
        meeting_id: String,
        message: String,
    },
}

impl Signal {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Initiate(s) => &s.parties.call_id,
            Self::MeetingReady(s) => &s.parties.call_id,
            Self::Accept(p) | Self::Timeout(p) => &p.call_id,
            Self::Decline { parties, .. }
            | Self::Cancel { parties, .. }
            | Self::MeetingProblem { parties, .. } => &parties.call_id,
            Self::SelfStopRing { call_id, .. } => call_id,
        }
    }
}

fn parse_field<T: std::str::FromStr<Err = String>>(
    payload: &SignalPayload,
    name: &'static str,
) -> Result<T, CallError> {
    payload
        .require(name)?
        .parse()
        .map_err(|reason| CallError::InvalidField { field: name, reason })
}

impl RawSignal {
    pub fn new(flag: SignalFlag, payload: SignalPayload) -> Self {
        Self { flag, payload }
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.payload.field("callId").map(CallId::new)
    }

    pub fn from_json(data: &str) -> Result<Self, CallError> {
        serde_json::from_str(data).map_err(|e| CallError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, CallError> {
        serde_json::to_string(self).map_err(|e| CallError::Parse(e.to_string()))
    }

    /// Validates the payload for its flag.
    ///
    /// A message without a call id is accepted only when `legacy_call_id` is
    /// given; it then refers to that call.
    pub fn parse(&self, legacy_call_id: Option<&CallId>) -> Result<Signal, CallError> {
        let p = &self.payload;
        for name in self.flag.required_fields() {
            if *name == "callId" && legacy_call_id.is_some() {
                continue;
            }
            if p.field(name).is_none() {
                return Err(CallError::MissingField(*name));
            }
        }

        let call_id = match (self.call_id(), legacy_call_id) {
            (Some(id), _) => id,
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => return Err(CallError::MissingField("callId")),
        };
        let to = p.require("to")?;

        let parties = || -> Result<Parties, CallError> {
            Ok(Parties {
                to: to.clone(),
                caller_id: p.require("callerId")?,
                callee_id: p.require("calleeId")?,
                call_id: call_id.clone(),
            })
        };

        let signal = match self.flag {
            SignalFlag::Initiate => Signal::Initiate(InitiateSignal {
                parties: parties()?,
                media_type: parse_field(p, "callType")?,
                caller_role: parse_field(p, "callerRole")?,
                callee_role: parse_field(p, "role")?,
            }),
            SignalFlag::Accept => Signal::Accept(parties()?),
            SignalFlag::Decline => Signal::Decline {
                parties: parties()?,
                reason: p.require("reason")?,
            },
            SignalFlag::Cancel => Signal::Cancel {
                parties: parties()?,
                reason: parse_field(p, "reason")?,
            },
            SignalFlag::Timeout => Signal::Timeout(parties()?),
            SignalFlag::SelfStopRing => Signal::SelfStopRing {
                to: to.clone(),
                callee_id: p.require("calleeId")?,
                call_id: call_id.clone(),
            },
            SignalFlag::MeetingReady => Signal::MeetingReady(MeetingReadySignal {
                parties: parties()?,
                meeting_id: p.require("meetingId")?,
                caller_role: parse_field(p, "callerRole")?,
                callee_role: parse_field(p, "calleeRole")?,
            }),
            SignalFlag::MeetingProblem => Signal::MeetingProblem {
                parties: parties()?,
                meeting_id: p.require("meetingId")?,
                message: p.require("message")?,
            },
        };
        Ok(signal)
    }
}

// Outbound builders.
impl RawSignal {
    fn addressed(flag: SignalFlag, to: &str, call_id: &CallId) -> Self {
        Self::new(
            flag,
            SignalPayload {
                to: Some(to.to_string()),
                call_id: Some(call_id.to_string()),
                ..Default::default()
            },
        )
    }

    fn between(
        flag: SignalFlag,
        to: &str,
        caller_id: &str,
        callee_id: &str,
        call_id: &CallId,
    ) -> Self {
        let mut signal = Self::addressed(flag, to, call_id);
        signal.payload.caller_id = Some(caller_id.to_string());
        signal.payload.callee_id = Some(callee_id.to_string());
        signal
    }

    fn to_peer(flag: SignalFlag, session: &CallSession) -> Self {
        Self::between(
            flag,
            session.peer_id(),
            &session.caller_id,
            &session.callee_id,
            &session.call_id,
        )
    }

    pub fn initiate(session: &CallSession) -> Self {
        let mut signal = Self::to_peer(SignalFlag::Initiate, session);
        signal.payload.call_type = Some(session.media_type.to_string());
        signal.payload.media_type = Some(session.media_type.to_string());
        signal.payload.role = Some(session.callee_role.to_string());
        signal.payload.caller_role = Some(session.caller_role.to_string());
        signal
    }

    pub fn accept(session: &CallSession) -> Self {
        Self::to_peer(SignalFlag::Accept, session)
    }

    /// Decline addressed to the caller of `call_id`.
    pub fn decline(caller_id: &str, callee_id: &str, call_id: &CallId, reason: &str) -> Self {
        let mut signal =
            Self::between(SignalFlag::Decline, caller_id, caller_id, callee_id, call_id);
        signal.payload.reason = Some(reason.to_string());
        signal
    }

    pub fn cancel(session: &CallSession, reason: WireEndReason) -> Self {
        let mut signal = Self::to_peer(SignalFlag::Cancel, session);
        signal.payload.reason = Some(reason.to_string());
        signal
    }

    pub fn timeout(session: &CallSession) -> Self {
        Self::to_peer(SignalFlag::Timeout, session)
    }

    /// Addressed to `own_id` so every device of that user stops ringing.
    pub fn self_stop_ring(own_id: &str, callee_id: &str, call_id: &CallId) -> Self {
        let mut signal = Self::addressed(SignalFlag::SelfStopRing, own_id, call_id);
        signal.payload.callee_id = Some(callee_id.to_string());
        signal
    }

    pub fn meeting_ready(session: &CallSession, meeting_id: &str) -> Self {
        let mut signal = Self::to_peer(SignalFlag::MeetingReady, session);
        signal.payload.meeting_id = Some(meeting_id.to_string());
        signal.payload.caller_role = Some(session.caller_role.to_string());
        signal.payload.callee_role = Some(session.callee_role.to_string());
        signal
    }

    pub fn meeting_problem(session: &CallSession, meeting_id: &str, message: &str) -> Self {
        let mut signal = Self::to_peer(SignalFlag::MeetingProblem, session);
        signal.payload.meeting_id = Some(meeting_id.to_string());
        signal.payload.message = Some(message.to_string());
        signal
    }
}
