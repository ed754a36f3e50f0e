//! The session state machine: owns the single live call and applies every
//! transition, whether triggered locally, by the peer, or by a timer.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use super::error::CallError;
use super::identity::{CallId, CallIdentityTracker};
use super::manager::{Command, ProvisioningOutcome};
use super::message::{InitiateSignal, MeetingReadySignal, Parties, RawSignal};
use super::notify::{LifecycleEvent, Notification, NotificationPayload, Notifier, Phase, Substate};
use super::state::{
    CallSession, CallTransition, EndCause, InvalidTransition, LifecycleState, LocalSide, MediaType,
    ParticipantRole, TerminationReason, WireEndReason, decline_reason, local_termination,
    remote_cancellation,
};
use super::timers::{TimerFired, TimerKind, TimerManager};
use crate::config::{LocalIdentity, SignalingConfig};
use crate::provisioning::{RoomGrant, RoomProvisioner, RoomRequest};
use crate::store::BlocklistStore;

/// Sent as `meetingId` in `meeting-problem` when no room was assigned yet.
const NO_MEETING: &str = "none";

struct InFlightProvisioning {
    call_id: CallId,
    handle: AbortHandle,
}

pub struct SessionMachine {
    local: LocalIdentity,
    config: SignalingConfig,
    session: Option<CallSession>,
    /// Coarse "last call is over" flag for messages that carry no call id.
    terminated: bool,
    identity: CallIdentityTracker,
    timers: TimerManager<Command>,
    blocklist: Arc<BlocklistStore>,
    provisioner: Arc<dyn RoomProvisioner>,
    provisioning: Option<InFlightProvisioning>,
    outbox: mpsc::UnboundedSender<RawSignal>,
    queue: mpsc::UnboundedSender<Command>,
    notifier: Notifier,
}

impl SessionMachine {
    /// `outbox` receives every outbound signal in send order; `queue` is the
    /// session loop's own queue, used for timer and provisioning callbacks.
    pub fn new(
        local: LocalIdentity,
        config: SignalingConfig,
        blocklist: Arc<BlocklistStore>,
        provisioner: Arc<dyn RoomProvisioner>,
        outbox: mpsc::UnboundedSender<RawSignal>,
        queue: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let notifier = Notifier::new(config.notification_dedup_window());
        Self {
            local,
            config,
            session: None,
            terminated: false,
            identity: CallIdentityTracker::new(),
            timers: TimerManager::new(queue.clone()),
            blocklist,
            provisioner,
            provisioning: None,
            outbox,
            queue,
            notifier,
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn identity(&self) -> &CallIdentityTracker {
        &self.identity
    }

    pub fn blocklist(&self) -> &Arc<BlocklistStore> {
        &self.blocklist
    }

    pub fn is_globally_terminated(&self) -> bool {
        self.terminated
    }

    pub fn notifications(&self) -> broadcast::Sender<Notification> {
        self.notifier.sender()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn timer_armed(&self, side: LocalSide, kind: TimerKind) -> bool {
        self.timers.is_armed(side, kind)
    }

    pub fn provisioning_in_flight(&self) -> bool {
        self.provisioning.is_some()
    }

    /// The session with `call_id`, if it is the current one.
    fn current(&self, call_id: &CallId) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| &s.call_id == call_id)
    }

    fn has_live_session(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.state.is_terminated())
    }

    fn send(&self, signal: RawSignal) {
        if self.outbox.send(signal).is_err() {
            warn!(target: "Calls/Machine", "Outbox closed, dropping outbound signal");
        }
    }

    fn notify(
        &mut self,
        side: LocalSide,
        phase: Phase,
        substate: Substate,
        payload: NotificationPayload,
    ) {
        self.notifier
            .emit(LifecycleEvent::new(side, phase), substate, payload);
    }

    pub fn start_call(
        &mut self,
        callee_id: &str,
        media_type: MediaType,
        callee_role: ParticipantRole,
    ) -> Result<CallId, CallError> {
        let callee_id = callee_id.trim();
        if self.local.user_id.trim().is_empty() {
            return Err(CallError::MissingField("callerId"));
        }
        if callee_id.is_empty() {
            return Err(CallError::MissingField("calleeId"));
        }
        if callee_id == self.local.user_id {
            return Err(CallError::InvalidField {
                field: "calleeId",
                reason: "cannot call yourself".into(),
            });
        }

        if self.has_live_session() {
            self.supersede("new outgoing call");
        }

        let call_id = self.identity.new_id();
        self.terminated = false;
        let session = CallSession::new_outgoing(
            call_id.clone(),
            &self.local,
            callee_id.to_string(),
            callee_role,
            media_type,
        );

        self.timers.arm(
            LocalSide::Caller,
            TimerKind::Ring,
            call_id.clone(),
            self.config.ring_timeout(),
        );
        self.send(RawSignal::initiate(&session));
        let payload = NotificationPayload::for_session(&session);
        self.session = Some(session);

        info!(target: "Calls/Machine", "Calling {callee_id} ({media_type}, call {call_id})");
        self.notify(LocalSide::Caller, Phase::CallWaiting, Substate::None, payload);
        Ok(call_id)
    }

    /// New incoming call. Blocked callers are dropped without a trace; a busy
    /// callee auto-declines without touching the active session.
    pub async fn receive_incoming(&mut self, signal: InitiateSignal) {
        let Parties {
            caller_id,
            callee_id,
            call_id,
            ..
        } = signal.parties;

        if self.blocklist.is_blocked(&caller_id).await {
            info!(target: "Calls/Machine", "Ignoring call {call_id} from blocked user {caller_id}");
            return;
        }
        if callee_id != self.local.user_id {
            warn!(
                target: "Calls/Machine",
                "Call {call_id} is addressed to {callee_id}, not {}", self.local.user_id
            );
            return;
        }
        if self.identity.is_terminated(&call_id) {
            debug!(target: "Calls/Machine", "Ignoring initiate for terminated call {call_id}");
            return;
        }

        if let Some(active) = &self.session
            && !active.state.is_terminated()
        {
            if active.call_id == call_id {
                debug!(target: "Calls/Machine", "Duplicate initiate for call {call_id}");
                return;
            }
            if active.in_call_or_connecting {
                info!(
                    target: "Calls/Machine",
                    "Busy on call {}, declining {call_id} from {caller_id}", active.call_id
                );
                self.send(RawSignal::decline(
                    &caller_id,
                    &callee_id,
                    &call_id,
                    TerminationReason::OnAnotherCall.as_str(),
                ));
                self.identity.mark_terminated(&call_id);
                return;
            }
            self.supersede("new incoming call");
        }

        self.terminated = false;
        let session = CallSession::new_incoming(
            call_id.clone(),
            caller_id,
            signal.caller_role,
            callee_id,
            signal.callee_role,
            signal.media_type,
        );
        self.timers.arm(
            LocalSide::Callee,
            TimerKind::Ring,
            call_id.clone(),
            self.config.callee_ring_timeout(),
        );
        let payload = NotificationPayload::for_session(&session);
        info!(
            target: "Calls/Machine",
            "Incoming {} call {call_id} from {}", session.media_type, session.caller_id
        );
        self.session = Some(session);
        self.notify(
            LocalSide::Callee,
            Phase::incoming(signal.media_type),
            Substate::None,
            payload,
        );
    }

    pub fn accept(&mut self) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.apply_transition(CallTransition::LocalAccepted)?;
        let session = session.clone();

        self.timers.cancel_all(LocalSide::Callee);
        self.send(RawSignal::accept(&session));
        self.send(RawSignal::self_stop_ring(
            &session.callee_id,
            &session.callee_id,
            &session.call_id,
        ));

        info!(target: "Calls/Machine", "Accepted call {}", session.call_id);
        self.notify(
            LocalSide::Callee,
            Phase::CallAccepted,
            Substate::None,
            NotificationPayload::for_session(&session),
        );
        Ok(())
    }

    pub fn reject(&mut self, reason: &str) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if !matches!(session.state, LifecycleState::IncomingCall(_)) {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", session.state),
                attempted: "LocalRejected".to_string(),
            }));
        }

        let reason = match reason.trim() {
            "" => TerminationReason::Declined.as_str(),
            r => r,
        };
        self.send(RawSignal::decline(
            &session.caller_id,
            &session.callee_id,
            &session.call_id,
            reason,
        ));
        info!(target: "Calls/Machine", "Rejected call {} ({reason})", session.call_id);
        self.conclude(TerminationReason::Declined, None);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<TerminationReason, CallError> {
        self.terminate(EndCause::User)
    }

    /// Ends the live call from this side; the reason follows the local
    /// termination table.
    pub fn terminate(&mut self, cause: EndCause) -> Result<TerminationReason, CallError> {
        let session = self
            .session
            .as_ref()
            .filter(|s| !s.state.is_terminated())
            .ok_or(CallError::NoActiveCall)?;
        let (reason, wire) = local_termination(session.local_side, session.state, cause)
            .ok_or(CallError::NoActiveCall)?;

        self.send(RawSignal::cancel(session, wire));
        info!(
            target: "Calls/Machine",
            "Ending call {} as {} ({reason})", session.call_id, session.local_side
        );
        self.conclude(reason, None);
        Ok(reason)
    }

    /// The media layer could not join the room.
    pub fn report_media_failure(&mut self, message: &str) -> Result<(), CallError> {
        if !self.has_live_session() {
            return Err(CallError::NoActiveCall);
        }
        self.fail_call(message);
        Ok(())
    }

    pub fn on_remote_accepted(&mut self, parties: Parties) {
        if self.terminated {
            debug!(
                target: "Calls/Machine",
                "Ignoring accept for {}: call is over", parties.call_id
            );
            return;
        }
        let Some(session) = self.current(&parties.call_id) else {
            debug!(target: "Calls/Machine", "Ignoring accept for unknown call {}", parties.call_id);
            return;
        };
        if !session.is_caller() || session.state != LifecycleState::CallWaiting {
            debug!(
                target: "Calls/Machine",
                "Ignoring accept for call {} in {:?}", parties.call_id, session.state
            );
            return;
        }
        if session.callee_id != parties.callee_id {
            warn!(
                target: "Calls/Machine",
                "Accept for call {} came from {}, expected {}",
                parties.call_id, parties.callee_id, session.callee_id
            );
            return;
        }

        // Ring or grace, whichever is pending.
        self.timers.cancel_all(LocalSide::Caller);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.apply_transition(CallTransition::RemoteAccepted) {
            warn!(target: "Calls/Machine", "{e}");
            return;
        }
        let payload = NotificationPayload::for_session(session);

        info!(
            target: "Calls/Machine",
            "Call {} accepted by {}", parties.call_id, parties.callee_id
        );
        self.notify(LocalSide::Caller, Phase::CallAccepted, Substate::None, payload);
        self.start_provisioning(None);
    }

    pub fn on_remote_declined(&mut self, parties: Parties, reason: &str) {
        let Some(session) = self.current(&parties.call_id) else {
            debug!(
                target: "Calls/Machine",
                "Ignoring decline for unknown call {}", parties.call_id
            );
            return;
        };
        if !session.is_caller() || session.state != LifecycleState::CallWaiting {
            debug!(
                target: "Calls/Machine",
                "Ignoring decline for call {} in {:?}", parties.call_id, session.state
            );
            return;
        }

        let substate = decline_reason(reason);
        info!(target: "Calls/Machine", "Call {} declined: {reason}", parties.call_id);
        self.conclude(substate, None);
    }

    pub fn on_remote_cancelled(&mut self, parties: Parties, wire: WireEndReason) {
        let Some(session) = self.current(&parties.call_id) else {
            debug!(target: "Calls/Machine", "Nothing to cancel for call {}", parties.call_id);
            return;
        };
        let Some(substate) = remote_cancellation(session.local_side, session.state) else {
            debug!(target: "Calls/Machine", "Call {} already over", parties.call_id);
            return;
        };

        info!(
            target: "Calls/Machine",
            "Peer ended call {} ({wire}), local substate {substate}", parties.call_id
        );
        self.conclude(substate, None);
    }

    pub fn on_remote_timeout(&mut self, parties: Parties) {
        let Some(session) = self.current(&parties.call_id) else {
            debug!(
                target: "Calls/Machine",
                "Ignoring timeout for unknown call {}", parties.call_id
            );
            return;
        };
        if session.is_caller() {
            debug!(target: "Calls/Machine", "Caller ignores timeout for call {}", parties.call_id);
            return;
        }

        let state = session.state;
        match state {
            LifecycleState::IncomingCall(_) => {
                info!(target: "Calls/Machine", "Caller stopped ringing call {}", parties.call_id);
                self.conclude(TerminationReason::NoAnswer, None);
            }
            state if state.is_active() => {
                // Our accept is in flight; the caller's grace window decides.
                debug!(
                    target: "Calls/Machine",
                    "Timeout for call {} after local accept, waiting for caller", parties.call_id
                );
            }
            state => debug!(
                target: "Calls/Machine",
                "Ignoring timeout for call {} in {state:?}", parties.call_id
            ),
        }
    }

    /// Another device of this user answered or the caller gave up; stop
    /// ringing here without reporting a termination.
    pub fn on_stop_ringing(&mut self, call_id: &CallId) {
        let Some(session) = self.current(call_id) else {
            return;
        };
        if session.is_caller() || !matches!(session.state, LifecycleState::IncomingCall(_)) {
            return;
        }
        let payload = NotificationPayload::for_session(session);

        self.timers.cancel_all(LocalSide::Callee);
        self.identity.mark_terminated(call_id);
        self.terminated = true;
        self.session = None;

        info!(target: "Calls/Machine", "Call {call_id} stopped ringing on this device");
        self.notify(LocalSide::Callee, Phase::Idle, Substate::None, payload);
    }

    pub fn on_meeting_ready(&mut self, signal: MeetingReadySignal) {
        let call_id = &signal.parties.call_id;
        let Some(session) = self.current(call_id) else {
            debug!(target: "Calls/Machine", "Ignoring meeting-ready for unknown call {call_id}");
            return;
        };
        if session.is_caller() || session.state != LifecycleState::CallAccepted {
            debug!(
                target: "Calls/Machine",
                "Ignoring meeting-ready for call {call_id} in {:?}", session.state
            );
            return;
        }
        if session.caller_role != signal.caller_role || session.callee_role != signal.callee_role {
            warn!(
                target: "Calls/Machine",
                "Roles in meeting-ready for call {call_id} differ from initiate ({}/{} vs {}/{})",
                signal.caller_role, signal.callee_role, session.caller_role, session.callee_role
            );
        }

        if let Some(session) = self.session.as_mut() {
            session.meeting_id = Some(signal.meeting_id.clone());
        }
        self.start_provisioning(Some(signal.meeting_id));
    }

    pub fn on_meeting_problem(&mut self, parties: Parties, meeting_id: &str, message: &str) {
        if self.current(&parties.call_id).is_none() {
            debug!(
                target: "Calls/Machine",
                "Ignoring meeting-problem for unknown call {}", parties.call_id
            );
            return;
        }
        warn!(
            target: "Calls/Machine",
            "Peer reported a problem with meeting {meeting_id} for call {}: {message}",
            parties.call_id
        );
        self.conclude(TerminationReason::Error, Some(message.to_string()));
    }

    pub fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.take_fired(&fired) {
            return;
        }
        match (fired.side, fired.kind) {
            (LocalSide::Caller, TimerKind::Ring) => self.on_ring_timeout_fired(&fired.call_id),
            (LocalSide::Caller, TimerKind::Grace) => self.on_grace_timeout_fired(&fired.call_id),
            (LocalSide::Callee, TimerKind::Ring) => self.on_callee_ring_timeout(&fired.call_id),
            (LocalSide::Callee, TimerKind::Grace) => {
                debug!(target: "Calls/Machine", "Callee grace timer has no effect");
            }
        }
    }

    fn on_ring_timeout_fired(&mut self, call_id: &CallId) {
        let Some(session) = self.current(call_id) else {
            debug!(target: "Calls/Machine", "Ring timeout for stale call {call_id}");
            return;
        };
        if !session.is_caller() || session.state != LifecycleState::CallWaiting {
            debug!(
                target: "Calls/Machine",
                "Ring timeout for call {call_id} in {:?}, ignoring", session.state
            );
            return;
        }

        info!(target: "Calls/Machine", "No answer for call {call_id}, entering grace period");
        let timeout = RawSignal::timeout(session);
        let stop_ring = RawSignal::self_stop_ring(&session.caller_id, &session.callee_id, call_id);
        self.send(timeout);
        self.send(stop_ring);
        self.timers.arm(
            LocalSide::Caller,
            TimerKind::Grace,
            call_id.clone(),
            self.config.grace_period(),
        );
    }

    fn on_grace_timeout_fired(&mut self, call_id: &CallId) {
        let Some(session) = self.current(call_id) else {
            debug!(target: "Calls/Machine", "Grace timeout for stale call {call_id}");
            return;
        };
        if session.state != LifecycleState::CallWaiting {
            debug!(
                target: "Calls/Machine",
                "Grace timeout for call {call_id} in {:?}, ignoring", session.state
            );
            return;
        }

        // A late accept that lost the race must not leave the callee waiting.
        self.send(RawSignal::cancel(session, WireEndReason::Cancelled));
        info!(target: "Calls/Machine", "Call {call_id} was not answered");
        self.conclude(TerminationReason::NoAnswer, None);
    }

    fn on_callee_ring_timeout(&mut self, call_id: &CallId) {
        let Some(session) = self.current(call_id) else {
            return;
        };
        if !matches!(session.state, LifecycleState::IncomingCall(_)) {
            return;
        }
        info!(target: "Calls/Machine", "Stopped ringing for unanswered call {call_id}");
        self.conclude(TerminationReason::NoAnswer, None);
    }

    fn start_provisioning(&mut self, meeting_id: Option<String>) {
        let Some(session) = &self.session else {
            return;
        };
        let request = RoomRequest {
            call_id: session.call_id.clone(),
            user_id: self.local.user_id.clone(),
            role: match session.local_side {
                LocalSide::Caller => session.caller_role,
                LocalSide::Callee => session.callee_role,
            },
            media_type: session.media_type,
        };
        let call_id = session.call_id.clone();

        self.abort_provisioning();
        let provisioner = Arc::clone(&self.provisioner);
        let queue = self.queue.clone();
        let outcome_call_id = call_id.clone();
        let handle = tokio::spawn(async move {
            let result = match meeting_id {
                None => provisioner.create_room(&request).await,
                Some(meeting_id) => provisioner.join_room(&meeting_id, &request).await,
            };
            let _ = queue.send(Command::Provisioned(ProvisioningOutcome {
                call_id: outcome_call_id,
                result,
            }));
        })
        .abort_handle();

        debug!(target: "Calls/Machine", "Provisioning room for call {call_id}");
        self.provisioning = Some(InFlightProvisioning { call_id, handle });
    }

    fn abort_provisioning(&mut self) {
        if let Some(in_flight) = self.provisioning.take() {
            in_flight.handle.abort();
            debug!(
                target: "Calls/Machine",
                "Aborted room provisioning for call {}", in_flight.call_id
            );
        }
    }

    pub fn on_provisioned(&mut self, outcome: ProvisioningOutcome) {
        let awaited = self
            .provisioning
            .as_ref()
            .is_some_and(|in_flight| in_flight.call_id == outcome.call_id);
        if !awaited {
            debug!(
                target: "Calls/Machine",
                "Discarding provisioning result for superseded call {}", outcome.call_id
            );
            return;
        }
        self.provisioning = None;
        let Some(session) = self.current(&outcome.call_id) else {
            return;
        };
        if session.state != LifecycleState::CallAccepted {
            debug!(
                target: "Calls/Machine",
                "Discarding provisioning result for call {} in {:?}",
                outcome.call_id, session.state
            );
            return;
        }

        match outcome.result {
            Ok(grant) => self.join_room(grant),
            Err(e) => {
                warn!(
                    target: "Calls/Machine",
                    "Room provisioning failed for call {}: {e}", outcome.call_id
                );
                self.fail_call(&e.to_string());
            }
        }
    }

    fn join_room(&mut self, grant: RoomGrant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.meeting_id = Some(grant.meeting_id.clone());
        if let Err(e) = session.apply_transition(CallTransition::RoomJoined) {
            warn!(target: "Calls/Machine", "{e}");
            return;
        }
        let session = session.clone();

        if session.is_caller() {
            self.send(RawSignal::meeting_ready(&session, &grant.meeting_id));
        }
        info!(
            target: "Calls/Machine",
            "Joined {} for call {}", grant.meeting_id, session.call_id
        );
        self.notify(
            session.local_side,
            Phase::ConnectedJoined,
            Substate::None,
            NotificationPayload::for_session(&session).with_room(grant),
        );
    }

    /// Collaborator failure: tell the peer, then end the call with `error`.
    fn fail_call(&mut self, message: &str) {
        let Some(session) = self.session.as_ref().filter(|s| !s.state.is_terminated()) else {
            return;
        };
        let meeting_id = session.meeting_id.as_deref().unwrap_or(NO_MEETING);
        self.send(RawSignal::meeting_problem(session, meeting_id, message));
        self.conclude(TerminationReason::Error, Some(message.to_string()));
    }

    /// Drops a live session without notifying the presentation layer; the
    /// peer still gets a cancel so it does not ring forever.
    pub fn supersede(&mut self, why: &str) {
        let Some(session) = self.session.as_mut().filter(|s| !s.state.is_terminated()) else {
            return;
        };
        let (reason, wire) = local_termination(session.local_side, session.state, EndCause::User)
            .unwrap_or((TerminationReason::Cancelled, WireEndReason::Cancelled));
        let cancel = RawSignal::cancel(session, wire);
        let call_id = session.call_id.clone();
        if let Err(e) = session.apply_transition(CallTransition::Terminated(reason)) {
            warn!(target: "Calls/Machine", "{e}");
        }

        self.send(cancel);
        self.timers.cancel_all(LocalSide::Caller);
        self.timers.cancel_all(LocalSide::Callee);
        self.abort_provisioning();
        self.identity.mark_terminated(&call_id);
        info!(target: "Calls/Machine", "Superseded call {call_id}: {why}");
    }

    /// Moves the live session to `terminated(reason)` and emits exactly one
    /// notification for it.
    fn conclude(&mut self, reason: TerminationReason, message: Option<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.apply_transition(CallTransition::Terminated(reason)) {
            debug!(target: "Calls/Machine", "{e}");
            return;
        }
        let side = session.local_side;
        let call_id = session.call_id.clone();
        let mut payload = NotificationPayload::for_session(session);
        if let Some(message) = message {
            payload = payload.with_message(message);
        }

        self.identity.mark_terminated(&call_id);
        self.terminated = true;
        self.timers.cancel_all(LocalSide::Caller);
        self.timers.cancel_all(LocalSide::Callee);
        self.abort_provisioning();

        self.notify(side, Phase::Terminated, Substate::Reason(reason), payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::message::Signal;
    use crate::calls::signaling::SignalFlag;
    use crate::provisioning::LocalRoomProvisioner;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        machine: SessionMachine,
        outbox: mpsc::UnboundedReceiver<RawSignal>,
        queue: mpsc::UnboundedReceiver<Command>,
        notes: broadcast::Receiver<Notification>,
    }

    impl Harness {
        async fn new(user: &str, role: ParticipantRole) -> Self {
            Self::with_provisioner(user, role, LocalRoomProvisioner::new()).await
        }

        async fn with_provisioner(
            user: &str,
            role: ParticipantRole,
            provisioner: LocalRoomProvisioner,
        ) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let blocklist = Arc::new(
                BlocklistStore::load(Arc::new(MemoryStore::new()))
                    .await
                    .unwrap(),
            );
            let (out_tx, outbox) = mpsc::unbounded_channel();
            let (queue_tx, queue) = mpsc::unbounded_channel();
            let machine = SessionMachine::new(
                LocalIdentity::new(user, role),
                SignalingConfig::default(),
                blocklist,
                Arc::new(provisioner),
                out_tx,
                queue_tx,
            );
            let notes = machine.subscribe();
            Self {
                machine,
                outbox,
                queue,
                notes,
            }
        }

        fn sent(&mut self) -> Vec<RawSignal> {
            let mut sent = Vec::new();
            while let Ok(signal) = self.outbox.try_recv() {
                sent.push(signal);
            }
            sent
        }

        fn notes(&mut self) -> Vec<Notification> {
            let mut notes = Vec::new();
            while let Ok(note) = self.notes.try_recv() {
                notes.push(note);
            }
            notes
        }

        /// Processes the next deferred event (timer or provisioning result).
        async fn step(&mut self) {
            let command = tokio::time::timeout(Duration::from_secs(600), self.queue.recv())
                .await
                .expect("a deferred event")
                .expect("queue open");
            match command {
                Command::Timer(fired) => self.machine.on_timer(fired),
                Command::Provisioned(outcome) => self.machine.on_provisioned(outcome),
                _ => panic!("unexpected command on queue"),
            }
        }

        fn state(&self) -> Option<LifecycleState> {
            self.machine.session().map(|s| s.state)
        }
    }

    fn initiate_from(
        caller: &str,
        callee: &str,
        call_id: &str,
        media: MediaType,
    ) -> InitiateSignal {
        let local = LocalIdentity::new(caller, ParticipantRole::Host);
        let session = CallSession::new_outgoing(
            CallId::new(call_id),
            &local,
            callee.into(),
            ParticipantRole::Attendee,
            media,
        );
        match RawSignal::initiate(&session).parse(None).unwrap() {
            Signal::Initiate(initiate) => initiate,
            other => panic!("expected initiate, got {other:?}"),
        }
    }

    fn parties(caller: &str, callee: &str, call_id: &CallId, to: &str) -> Parties {
        Parties {
            to: to.into(),
            caller_id: caller.into(),
            callee_id: callee.into(),
            call_id: call_id.clone(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_call_sends_initiate_and_arms_ring_timer() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Video, ParticipantRole::Attendee)
            .unwrap();

        assert_eq!(h.state(), Some(LifecycleState::CallWaiting));
        assert!(h.machine.timer_armed(LocalSide::Caller, TimerKind::Ring));
        assert!(!h.machine.is_globally_terminated());

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flag, SignalFlag::Initiate);
        assert_eq!(sent[0].payload.call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(sent[0].payload.call_type.as_deref(), Some("video"));

        let notes = h.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].state.to_string(), "caller:callWaiting");
    }

    #[tokio::test(start_paused = true)]
    async fn start_call_validates_input() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        assert!(matches!(
            h.machine
                .start_call("  ", MediaType::Audio, ParticipantRole::Attendee),
            Err(CallError::MissingField("calleeId"))
        ));
        assert!(matches!(
            h.machine
                .start_call("alice", MediaType::Audio, ParticipantRole::Attendee),
            Err(CallError::InvalidField { .. })
        ));
        assert!(h.sent().is_empty());
        assert!(h.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_call_gets_fresh_id_and_clears_terminated_flag() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let first = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.machine.cancel().unwrap();
        assert!(h.machine.is_globally_terminated());
        assert!(h.machine.identity().is_terminated(&first));

        let second = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        assert_ne!(first, second);
        assert!(!h.machine.identity().is_terminated(&second));
        assert!(!h.machine.is_globally_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_over_a_live_call_supersedes_it() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let first = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.sent();
        h.notes();

        h.machine
            .start_call("carol", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        assert!(h.machine.identity().is_terminated(&first));

        let sent = h.sent();
        assert_eq!(sent[0].flag, SignalFlag::Cancel);
        assert_eq!(sent[0].payload.to.as_deref(), Some("bob"));
        assert_eq!(sent[1].flag, SignalFlag::Initiate);

        let notes = h.notes();
        assert_eq!(notes.len(), 1, "superseding emits no terminated notification");
        assert_eq!(notes[0].state.phase, Phase::CallWaiting);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_call_adopts_identities_from_message() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Video))
            .await;

        let session = h.machine.session().unwrap();
        assert_eq!(session.caller_id, "alice");
        assert_eq!(session.callee_id, "bob");
        assert_eq!(session.caller_role, ParticipantRole::Host);
        assert_eq!(session.local_side, LocalSide::Callee);
        assert!(h.machine.timer_armed(LocalSide::Callee, TimerKind::Ring));

        let notes = h.notes();
        assert_eq!(notes[0].state.to_string(), "callee:incomingVideoCall");
        assert_eq!(notes[0].substate, Substate::None);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_caller_produces_nothing() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine.blocklist().block_permanent("mallory").await.unwrap();

        h.machine
            .receive_incoming(initiate_from("mallory", "bob", "c1", MediaType::Audio))
            .await;

        assert!(h.machine.session().is_none());
        assert!(h.sent().is_empty());
        assert!(h.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_callee_auto_declines_without_touching_active_call() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("carol", "bob", "active", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();
        h.sent();
        h.notes();

        h.machine
            .receive_incoming(initiate_from("alice", "bob", "second", MediaType::Video))
            .await;

        let session = h.machine.session().unwrap();
        assert_eq!(session.call_id, CallId::new("active"));
        assert_eq!(session.state, LifecycleState::CallAccepted);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flag, SignalFlag::Decline);
        assert_eq!(sent[0].payload.to.as_deref(), Some("alice"));
        assert_eq!(sent[0].payload.reason.as_deref(), Some("on_another_call"));
        assert!(h.machine.identity().is_terminated(&CallId::new("second")));
        assert!(h.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_sends_accept_and_stop_ringing() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();

        assert!(h.machine.session().unwrap().in_call_or_connecting);
        assert!(!h.machine.timer_armed(LocalSide::Callee, TimerKind::Ring));

        let flags: Vec<SignalFlag> = h.sent().iter().map(|s| s.flag).collect();
        assert_eq!(flags, vec![SignalFlag::Accept, SignalFlag::SelfStopRing]);
        assert!(h.machine.accept().is_err(), "accept is only valid while ringing");
    }

    #[tokio::test(start_paused = true)]
    async fn reject_declines_with_reason() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.notes();
        h.machine.reject("busy").unwrap();

        assert_eq!(
            h.state(),
            Some(LifecycleState::Terminated(TerminationReason::Declined))
        );
        let sent = h.sent();
        assert_eq!(sent[0].flag, SignalFlag::Decline);
        assert_eq!(sent[0].payload.reason.as_deref(), Some("busy"));

        let notes = h.notes();
        assert_eq!(notes[0].state.to_string(), "callee:terminated");
        assert_eq!(notes[0].substate, Substate::Reason(TerminationReason::Declined));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancel_from_waiting_is_cancelled() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        h.machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.sent();

        assert_eq!(h.machine.cancel().unwrap(), TerminationReason::Cancelled);
        let sent = h.sent();
        assert_eq!(sent[0].flag, SignalFlag::Cancel);
        assert_eq!(sent[0].payload.reason.as_deref(), Some("cancelled"));
        assert!(!h.machine.timer_armed(LocalSide::Caller, TimerKind::Ring));
        assert!(matches!(h.machine.cancel(), Err(CallError::NoActiveCall)));
    }

    #[tokio::test(start_paused = true)]
    async fn callee_terminate_after_accept_uses_cause() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();
        h.sent();

        assert_eq!(
            h.machine.terminate(EndCause::InsufficientTokens).unwrap(),
            TerminationReason::InsufficientTokens
        );
        assert_eq!(h.sent()[0].payload.reason.as_deref(), Some("ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn ring_timeout_then_grace_ends_with_no_answer() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Video, ParticipantRole::Attendee)
            .unwrap();
        h.sent();
        h.notes();

        h.step().await; // ring timeout
        let flags: Vec<SignalFlag> = h.sent().iter().map(|s| s.flag).collect();
        assert_eq!(flags, vec![SignalFlag::Timeout, SignalFlag::SelfStopRing]);
        assert!(h.machine.timer_armed(LocalSide::Caller, TimerKind::Grace));
        assert_eq!(h.state(), Some(LifecycleState::CallWaiting));

        h.step().await; // grace timeout
        assert_eq!(
            h.state(),
            Some(LifecycleState::Terminated(TerminationReason::NoAnswer))
        );
        assert!(h.machine.identity().is_terminated(&call_id));
        let notes = h.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].substate, Substate::Reason(TerminationReason::NoAnswer));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_during_grace_rescues_call() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.step().await; // ring timeout
        assert!(h.machine.timer_armed(LocalSide::Caller, TimerKind::Grace));

        h.machine
            .on_remote_accepted(parties("alice", "bob", &call_id, "alice"));
        assert_eq!(h.state(), Some(LifecycleState::CallAccepted));
        assert!(!h.machine.timer_armed(LocalSide::Caller, TimerKind::Grace));
        assert!(h.machine.provisioning_in_flight());

        h.step().await; // provisioning result
        assert_eq!(h.state(), Some(LifecycleState::ConnectedJoined));
        let sent = h.sent();
        assert_eq!(sent.last().unwrap().flag, SignalFlag::MeetingReady);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ring_timer_has_no_effect() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        // Pretend the firing already sat in the queue when the call advanced.
        h.machine
            .on_remote_accepted(parties("alice", "bob", &call_id, "alice"));
        h.sent();
        h.notes();

        h.machine.on_ring_timeout_fired(&call_id);
        h.machine.on_grace_timeout_fired(&call_id);

        assert_eq!(h.state(), Some(LifecycleState::CallAccepted));
        assert!(h.sent().is_empty());
        assert!(h.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_accept_after_termination_is_ignored() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.machine.cancel().unwrap();
        h.notes();

        h.machine
            .on_remote_accepted(parties("alice", "bob", &call_id, "alice"));
        assert_eq!(
            h.state(),
            Some(LifecycleState::Terminated(TerminationReason::Cancelled))
        );
        assert!(h.notes().is_empty());
        assert!(!h.machine.provisioning_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_decline_carries_busy_reason() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.notes();

        h.machine
            .on_remote_declined(parties("alice", "bob", &call_id, "alice"), "on_another_call");
        let notes = h.notes();
        assert_eq!(notes[0].state.to_string(), "caller:terminated");
        assert_eq!(
            notes[0].substate,
            Substate::Reason(TerminationReason::OnAnotherCall)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn callee_cancelled_after_accept_before_meeting_ready() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();
        h.notes();

        h.machine.on_remote_cancelled(
            parties("alice", "bob", &CallId::new("c1"), "bob"),
            WireEndReason::Ended,
        );
        let notes = h.notes();
        assert_eq!(notes[0].state.to_string(), "callee:terminated");
        assert_eq!(notes[0].substate, Substate::Reason(TerminationReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_timeout_while_ringing_is_no_answer() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.notes();

        h.machine
            .on_remote_timeout(parties("alice", "bob", &CallId::new("c1"), "bob"));
        assert_eq!(
            h.notes()[0].substate,
            Substate::Reason(TerminationReason::NoAnswer)
        );
        assert!(!h.machine.timer_armed(LocalSide::Callee, TimerKind::Ring));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_timeout_after_accept_waits_for_caller() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();
        h.notes();

        h.machine
            .on_remote_timeout(parties("alice", "bob", &CallId::new("c1"), "bob"));
        assert_eq!(h.state(), Some(LifecycleState::CallAccepted));
        assert!(h.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn callee_ring_timer_ends_unanswered_call() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.notes();

        h.step().await;
        assert_eq!(
            h.state(),
            Some(LifecycleState::Terminated(TerminationReason::NoAnswer))
        );
        assert_eq!(h.notes()[0].state.to_string(), "callee:terminated");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ringing_on_other_device() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.notes();

        h.machine.on_stop_ringing(&CallId::new("c1"));
        assert!(h.machine.session().is_none());
        assert!(h.machine.identity().is_terminated(&CallId::new("c1")));
        assert_eq!(h.notes()[0].state.to_string(), "callee:idle");
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_terminates_with_error() {
        let mut h = Harness::with_provisioner(
            "alice",
            ParticipantRole::Host,
            LocalRoomProvisioner::new().failing("no capacity"),
        )
        .await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.machine
            .on_remote_accepted(parties("alice", "bob", &call_id, "alice"));
        h.sent();
        h.notes();

        h.step().await;
        let sent = h.sent();
        assert_eq!(sent[0].flag, SignalFlag::MeetingProblem);
        assert_eq!(sent[0].payload.message.as_deref(), Some("no capacity"));

        let notes = h.notes();
        assert_eq!(notes[0].substate, Substate::Reason(TerminationReason::Error));
        assert_eq!(notes[0].payload.message.as_deref(), Some("no capacity"));
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_result_for_cancelled_call_is_discarded() {
        let mut h = Harness::with_provisioner(
            "alice",
            ParticipantRole::Host,
            LocalRoomProvisioner::new().with_latency(Duration::from_secs(3)),
        )
        .await;
        let call_id = h
            .machine
            .start_call("bob", MediaType::Audio, ParticipantRole::Attendee)
            .unwrap();
        h.machine
            .on_remote_accepted(parties("alice", "bob", &call_id, "alice"));
        h.machine.cancel().unwrap();
        assert!(!h.machine.provisioning_in_flight());

        // A result that raced the abort is still rejected.
        h.machine.on_provisioned(ProvisioningOutcome {
            call_id: call_id.clone(),
            result: Ok(RoomGrant {
                meeting_id: "room-late".into(),
                attendee_id: "room-late/alice".into(),
                join_token: "t".into(),
            }),
        });
        assert_eq!(
            h.state(),
            Some(LifecycleState::Terminated(TerminationReason::Busy))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn meeting_problem_from_peer_ends_call_with_message() {
        let mut h = Harness::new("bob", ParticipantRole::Attendee).await;
        h.machine
            .receive_incoming(initiate_from("alice", "bob", "c1", MediaType::Audio))
            .await;
        h.machine.accept().unwrap();
        h.sent();
        h.notes();

        h.machine.on_meeting_problem(
            parties("alice", "bob", &CallId::new("c1"), "bob"),
            "none",
            "room service down",
        );
        let notes = h.notes();
        assert_eq!(notes[0].substate, Substate::Reason(TerminationReason::Error));
        assert_eq!(notes[0].payload.message.as_deref(), Some("room service down"));
        assert!(h.sent().is_empty(), "no meeting-problem echo");
    }

    #[tokio::test(start_paused = true)]
    async fn media_failure_requires_live_call() {
        let mut h = Harness::new("alice", ParticipantRole::Host).await;
        assert!(matches!(
            h.machine.report_media_failure("camera busy"),
            Err(CallError::NoActiveCall)
        ));
    }
}
