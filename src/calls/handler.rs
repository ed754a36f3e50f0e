//! Inbound signal dispatch.

use log::{debug, warn};

use super::guard::{self, Admission};
use super::machine::SessionMachine;
use super::message::{RawSignal, Signal};

impl SessionMachine {
    /// Screens, validates and applies one inbound signal.
    pub async fn handle_signal(&mut self, raw: RawSignal) {
        if let Admission::Drop(_) = guard::screen(self, &raw).await {
            return;
        }

        // Older peers omit the call id; such messages refer to the live call.
        let legacy_call_id = match raw.call_id() {
            Some(_) => None,
            None => self.session().map(|s| s.call_id.clone()),
        };
        let signal = match raw.parse(legacy_call_id.as_ref()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(target: "Calls/Handler", "Dropping malformed {} message: {e}", raw.flag);
                return;
            }
        };

        debug!(
            target: "Calls/Handler",
            "Received {} for call {}", raw.flag, signal.call_id()
        );

        match signal {
            Signal::Initiate(initiate) => self.receive_incoming(initiate).await,
            Signal::Accept(parties) => self.on_remote_accepted(parties),
            Signal::Decline { parties, reason } => self.on_remote_declined(parties, &reason),
            Signal::Cancel { parties, reason } => self.on_remote_cancelled(parties, reason),
            Signal::Timeout(parties) => self.on_remote_timeout(parties),
            Signal::SelfStopRing { call_id, .. } => self.on_stop_ringing(&call_id),
            Signal::MeetingReady(ready) => self.on_meeting_ready(ready),
            Signal::MeetingProblem {
                parties,
                meeting_id,
                message,
            } => self.on_meeting_problem(parties, &meeting_id, &message),
        }
    }
}
