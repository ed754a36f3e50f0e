//! Named message flags of the call signaling protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Flag under which a signaling message travels over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalFlag {
    /// Caller offers a new call.
    Initiate,
    /// Callee answered.
    Accept,
    /// Callee refused, with a reason.
    Decline,
    /// Either side ends the call. Always delivered past the staleness filter.
    Cancel,
    /// Caller gave up waiting for an answer.
    Timeout,
    /// Sent to the sender's own devices so they stop ringing.
    SelfStopRing,
    /// Caller provisioned the media room.
    MeetingReady,
    /// Room provisioning or joining failed on the sending side.
    MeetingProblem,
}

impl SignalFlag {
    pub const ALL: [SignalFlag; 8] = [
        Self::Initiate,
        Self::Accept,
        Self::Decline,
        Self::Cancel,
        Self::Timeout,
        Self::SelfStopRing,
        Self::MeetingReady,
        Self::MeetingProblem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
            Self::SelfStopRing => "self-stop-ring",
            Self::MeetingReady => "meeting-ready",
            Self::MeetingProblem => "meeting-problem",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.as_str() == name)
    }

    /// Payload fields that must be present and non-empty.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Initiate => &[
                "to",
                "callType",
                "callerId",
                "calleeId",
                "role",
                "callerRole",
                "callId",
            ],
            Self::Accept => &["to", "callerId", "calleeId", "callId"],
            Self::Decline => &["to", "callerId", "calleeId", "reason", "callId"],
            Self::Cancel => &["to", "callerId", "calleeId", "callId", "reason"],
            Self::Timeout => &["to", "callerId", "calleeId", "callId"],
            Self::SelfStopRing => &["to", "calleeId", "callId"],
            Self::MeetingReady => &[
                "to",
                "meetingId",
                "callerId",
                "calleeId",
                "callerRole",
                "calleeRole",
                "callId",
            ],
            Self::MeetingProblem => &[
                "to",
                "meetingId",
                "callerId",
                "calleeId",
                "message",
                "callId",
            ],
        }
    }
}

impl fmt::Display for SignalFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
