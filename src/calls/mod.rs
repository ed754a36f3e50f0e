//! One-on-one call signaling.
//!
//! This module drives a single audio or video call between two users from
//! the first `initiate` until both sides have either joined a media room or
//! reached a terminal state.
//!
//! # Architecture
//!
//! - [`SignalFlag`] & [`RawSignal`]: The wire envelope and its eight flags
//! - [`LifecycleState`] & [`CallSession`]: The per-call state machine data
//! - [`CallIdentityTracker`]: Fresh call ids and the set of finished ones
//! - [`TimerManager`]: Ring and grace timers that re-enter the session queue
//! - [`SessionMachine`]: Applies every transition and emits notifications
//! - [`guard::screen`]: Drops blocked, stale and duplicate inbound messages
//! - [`CallManager`]: Runs the machine on one task behind an async handle
//!
//! # Flow Overview
//!
//! The caller sends `initiate` and rings for the ring timeout. Without an
//! answer it sends `timeout`, waits out a grace period for a late `accept`,
//! and ends with `no_answer`. Once accepted, the caller creates a room and
//! sends `meeting-ready`; the callee joins the same room. Either side may
//! send `cancel` at any point.

mod error;
pub mod guard;
mod handler;
mod identity;
mod machine;
mod manager;
mod message;
mod notify;
mod signaling;
mod state;
mod timers;

pub use error::CallError;
pub use guard::{Admission, DropReason};
pub use identity::{CallId, CallIdentityTracker};
pub use machine::SessionMachine;
pub use manager::{CallManager, Command, ProvisioningOutcome};
pub use message::{
    InitiateSignal, MeetingReadySignal, Parties, RawSignal, Signal, SignalPayload,
};
pub use notify::{LifecycleEvent, Notification, NotificationPayload, Notifier, Phase, Substate};
pub use signaling::SignalFlag;
pub use state::{
    CallSession, CallTransition, EndCause, InvalidTransition, LifecycleState, LocalSide,
    MediaType, ParticipantRole, TerminationReason, WireEndReason, decline_reason,
    local_termination, remote_cancellation,
};
pub use timers::{TimerFired, TimerKind, TimerManager};
