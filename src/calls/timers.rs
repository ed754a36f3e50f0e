//! One-shot ring and grace timers that re-enter the session queue.

use log::{debug, trace};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::identity::CallId;
use super::state::LocalSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires when nobody answered within the ring timeout.
    Ring,
    /// Caller only: last chance for a late accept after the ring timeout.
    Grace,
}

/// Posted back onto the session queue when a timer elapses.
///
/// Carries the call id it was armed for so the receiver can re-validate it
/// against the session before acting.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub side: LocalSide,
    pub kind: TimerKind,
    pub call_id: CallId,
    token: u64,
}

struct ArmedTimer {
    token: u64,
    call_id: CallId,
    handle: AbortHandle,
}

/// Owns the per-role one-shot timers.
///
/// A firing is only honoured through [`TimerManager::take_fired`], which
/// accepts each arm at most once and never after it was cancelled, even if
/// the sleep already completed and the event is sitting in the queue.
pub struct TimerManager<E> {
    tx: mpsc::UnboundedSender<E>,
    armed: HashMap<(LocalSide, TimerKind), ArmedTimer>,
    next_token: u64,
}

impl<E> TimerManager<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arms `kind` for `side`, replacing any timer of the same kind.
    pub fn arm(&mut self, side: LocalSide, kind: TimerKind, call_id: CallId, delay: Duration) {
        self.cancel(side, kind);

        self.next_token += 1;
        let token = self.next_token;
        let fired = TimerFired {
            side,
            kind,
            call_id: call_id.clone(),
            token,
        };

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The queue is gone when the session loop shut down.
            let _ = tx.send(E::from(fired));
        })
        .abort_handle();

        debug!(
            target: "Calls/Timers",
            "Armed {side} {kind:?} timer for call {call_id} ({}ms)",
            delay.as_millis()
        );
        self.armed.insert(
            (side, kind),
            ArmedTimer {
                token,
                call_id,
                handle,
            },
        );
    }

    /// Returns true if a timer was armed.
    pub fn cancel(&mut self, side: LocalSide, kind: TimerKind) -> bool {
        match self.armed.remove(&(side, kind)) {
            Some(timer) => {
                timer.handle.abort();
                trace!(
                    target: "Calls/Timers",
                    "Cancelled {side} {kind:?} timer for call {}",
                    timer.call_id
                );
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self, side: LocalSide) {
        self.cancel(side, TimerKind::Ring);
        self.cancel(side, TimerKind::Grace);
    }

    pub fn is_armed(&self, side: LocalSide, kind: TimerKind) -> bool {
        self.armed.contains_key(&(side, kind))
    }

    /// Consumes a firing if it belongs to the currently armed timer.
    pub fn take_fired(&mut self, fired: &TimerFired) -> bool {
        let key = (fired.side, fired.kind);
        match self.armed.get(&key) {
            Some(timer) if timer.token == fired.token => {
                self.armed.remove(&key);
                true
            }
            _ => {
                debug!(
                    target: "Calls/Timers",
                    "Ignoring stale {} {:?} firing for call {}",
                    fired.side, fired.kind, fired.call_id
                );
                false
            }
        }
    }
}

impl<E> Drop for TimerManager<E> {
    fn drop(&mut self) {
        for timer in self.armed.values() {
            timer.handle.abort();
        }
    }
}
