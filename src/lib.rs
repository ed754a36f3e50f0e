//! Signaling core for one-on-one audio and video calls.
//!
//! Platform concerns live behind traits: [`transport::SignalTransport`]
//! carries messages, [`provisioning::RoomProvisioner`] creates media rooms
//! and [`store::KeyValueBackend`] persists the blocklist.

pub mod calls;
pub mod config;
pub mod provisioning;
pub mod store;
pub mod transport;

pub use calls::{
    CallError, CallId, CallManager, CallSession, LifecycleState, LocalSide, MediaType,
    Notification, ParticipantRole, RawSignal, SignalFlag, TerminationReason,
};
pub use config::{LocalIdentity, SignalingConfig};
