//! Screens inbound signals before they reach the state machine.

use log::debug;
use std::fmt;

use super::machine::SessionMachine;
use super::message::RawSignal;
use super::signaling::SignalFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BlockedCaller,
    /// The call id was already concluded or superseded.
    TerminatedCall,
    DuplicateInitiate,
    /// No call id, and the last call is over.
    NoLiveCall,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BlockedCaller => "caller is blocked",
            Self::TerminatedCall => "call already terminated",
            Self::DuplicateInitiate => "duplicate initiate",
            Self::NoLiveCall => "no call id and no live call",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Pass,
    Drop(DropReason),
}

/// Decides whether `signal` may be dispatched. Screening never changes the
/// session; a newer initiate supersedes a ringing call only once it has
/// parsed and is known to be addressed to this user.
pub async fn screen(machine: &SessionMachine, signal: &RawSignal) -> Admission {
    let admission = evaluate(machine, signal).await;
    if let Admission::Drop(reason) = admission {
        debug!(target: "Calls/Guard", "Dropping {} message: {reason}", signal.flag);
    }
    admission
}

async fn evaluate(machine: &SessionMachine, signal: &RawSignal) -> Admission {
    let call_id = signal.call_id();

    match signal.flag {
        // The peer must always be able to stop a call.
        SignalFlag::Cancel => Admission::Pass,
        SignalFlag::Initiate => {
            if let Some(caller) = signal.payload.field("callerId")
                && machine.blocklist().is_blocked(caller).await
            {
                return Admission::Drop(DropReason::BlockedCaller);
            }
            let Some(call_id) = call_id else {
                return Admission::Pass;
            };
            if machine.identity().is_terminated(&call_id) {
                return Admission::Drop(DropReason::TerminatedCall);
            }
            match machine.session() {
                Some(session) if !session.state.is_terminated() && session.call_id == call_id => {
                    Admission::Drop(DropReason::DuplicateInitiate)
                }
                _ => Admission::Pass,
            }
        }
        _ => match call_id {
            Some(call_id) if machine.identity().is_terminated(&call_id) => {
                Admission::Drop(DropReason::TerminatedCall)
            }
            Some(_) => Admission::Pass,
            None if machine.is_globally_terminated() => Admission::Drop(DropReason::NoLiveCall),
            None => Admission::Pass,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::identity::CallId;
    use crate::calls::manager::Command;
    use crate::calls::message::Signal;
    use crate::calls::state::{
        CallSession, LifecycleState, MediaType, ParticipantRole, WireEndReason,
    };
    use crate::config::{LocalIdentity, SignalingConfig};
    use crate::provisioning::LocalRoomProvisioner;
    use crate::store::{BlocklistStore, MemoryStore};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn machine_for(
        user: &str,
    ) -> (
        SessionMachine,
        mpsc::UnboundedReceiver<RawSignal>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let _ = env_logger::builder().is_test(true).try_init();
        let blocklist = Arc::new(BlocklistStore::load(Arc::new(MemoryStore::new())).await.unwrap());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let machine = SessionMachine::new(
            LocalIdentity::new(user, ParticipantRole::Attendee),
            SignalingConfig::default(),
            blocklist,
            Arc::new(LocalRoomProvisioner::new()),
            out_tx,
            queue_tx,
        );
        (machine, out_rx, queue_rx)
    }

    fn session(caller: &str, callee: &str, call_id: &str) -> CallSession {
        CallSession::new_outgoing(
            CallId::new(call_id),
            &LocalIdentity::new(caller, ParticipantRole::Host),
            callee.into(),
            ParticipantRole::Attendee,
            MediaType::Audio,
        )
    }

    fn initiate(caller: &str, call_id: &str) -> RawSignal {
        RawSignal::initiate(&session(caller, "bob", call_id))
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_always_passes() {
        let (machine, _out, _queue) = machine_for("bob").await;
        machine.blocklist().block_permanent("alice").await.unwrap();
        let mut cancel =
            RawSignal::cancel(&session("alice", "bob", "c1"), WireEndReason::Cancelled);
        cancel.payload.call_id = None;

        assert_eq!(screen(&machine, &cancel).await, Admission::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_caller_is_dropped() {
        let (machine, _out, _queue) = machine_for("bob").await;
        machine.blocklist().block_permanent("mallory").await.unwrap();

        assert_eq!(
            screen(&machine, &initiate("mallory", "c1")).await,
            Admission::Drop(DropReason::BlockedCaller)
        );
        assert_eq!(screen(&machine, &initiate("alice", "c2")).await, Admission::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_and_duplicate_initiates_are_dropped() {
        let (mut machine, _out, _queue) = machine_for("bob").await;
        let Ok(Signal::Initiate(first)) = initiate("alice", "c1").parse(None) else {
            panic!("initiate should parse");
        };
        machine.receive_incoming(first).await;

        assert_eq!(
            screen(&machine, &initiate("alice", "c1")).await,
            Admission::Drop(DropReason::DuplicateInitiate)
        );

        machine.reject("declined").unwrap();
        assert_eq!(
            screen(&machine, &initiate("alice", "c1")).await,
            Admission::Drop(DropReason::TerminatedCall)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn screening_leaves_ringing_session_alone() {
        let (mut machine, mut out, _queue) = machine_for("bob").await;
        let Ok(Signal::Initiate(first)) = initiate("alice", "old").parse(None) else {
            panic!("initiate should parse");
        };
        machine.receive_incoming(first).await;

        assert_eq!(screen(&machine, &initiate("alice", "new")).await, Admission::Pass);
        assert!(!machine.identity().is_terminated(&CallId::new("old")));
        assert_eq!(
            machine.session().map(|s| s.state),
            Some(LifecycleState::IncomingCall(MediaType::Audio))
        );
        assert!(out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_session_is_not_superseded() {
        let (mut machine, _out, _queue) = machine_for("bob").await;
        let Ok(Signal::Initiate(first)) = initiate("alice", "active").parse(None) else {
            panic!("initiate should parse");
        };
        machine.receive_incoming(first).await;
        machine.accept().unwrap();

        assert_eq!(screen(&machine, &initiate("carol", "other")).await, Admission::Pass);
        assert_eq!(
            machine.session().map(|s| s.state),
            Some(LifecycleState::CallAccepted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_without_call_id_after_termination_is_dropped() {
        let (mut machine, _out, _queue) = machine_for("bob").await;
        let mut timeout = RawSignal::timeout(&session("alice", "bob", "c1"));
        timeout.payload.call_id = None;

        assert_eq!(screen(&machine, &timeout).await, Admission::Pass);

        let Ok(Signal::Initiate(first)) = initiate("alice", "c1").parse(None) else {
            panic!("initiate should parse");
        };
        machine.receive_incoming(first).await;
        machine.reject("declined").unwrap();
        assert!(machine.is_globally_terminated());
        assert_eq!(
            screen(&machine, &timeout).await,
            Admission::Drop(DropReason::NoLiveCall)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_for_terminated_call_is_dropped() {
        let (mut machine, _out, _queue) = machine_for("bob").await;
        let Ok(Signal::Initiate(first)) = initiate("alice", "c1").parse(None) else {
            panic!("initiate should parse");
        };
        machine.receive_incoming(first).await;
        machine.reject("declined").unwrap();

        let accept = RawSignal::accept(&session("alice", "bob", "c1"));
        assert_eq!(
            screen(&machine, &accept).await,
            Admission::Drop(DropReason::TerminatedCall)
        );
    }
}
