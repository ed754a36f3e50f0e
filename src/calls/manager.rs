//! Call manager: runs the session machine on a single task and exposes it
//! through an async handle.
//!
//! Local actions, inbound signals, timer firings and provisioning results
//! all become [`Command`]s on one queue, so the machine never sees two
//! events at once.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::identity::CallId;
use super::machine::SessionMachine;
use super::message::RawSignal;
use super::notify::Notification;
use super::state::{CallSession, EndCause, MediaType, ParticipantRole, TerminationReason};
use super::timers::TimerFired;
use crate::config::{LocalIdentity, SignalingConfig};
use crate::provisioning::{RoomGrant, RoomProvisioner};
use crate::store::BlocklistStore;
use crate::transport::SignalTransport;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Result of a room create or join, tagged with the call it was started for.
#[derive(Debug)]
pub struct ProvisioningOutcome {
    pub call_id: CallId,
    pub result: Result<RoomGrant, anyhow::Error>,
}

/// One unit of work for the session loop.
#[derive(Debug)]
pub enum Command {
    StartCall {
        callee_id: String,
        media_type: MediaType,
        callee_role: ParticipantRole,
        reply: Reply<CallId>,
    },
    Accept(Reply<()>),
    Reject {
        reason: String,
        reply: Reply<()>,
    },
    Terminate {
        cause: EndCause,
        reply: Reply<TerminationReason>,
    },
    ReportMediaFailure {
        message: String,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<Option<CallSession>>),
    Inbound(RawSignal),
    Timer(TimerFired),
    Provisioned(ProvisioningOutcome),
    Shutdown,
}

impl From<TimerFired> for Command {
    fn from(fired: TimerFired) -> Self {
        Self::Timer(fired)
    }
}

impl SessionMachine {
    /// Applies one command. Returns false once the loop should stop.
    pub async fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::StartCall {
                callee_id,
                media_type,
                callee_role,
                reply,
            } => {
                let _ = reply.send(self.start_call(&callee_id, media_type, callee_role));
            }
            Command::Accept(reply) => {
                let _ = reply.send(self.accept());
            }
            Command::Reject { reason, reply } => {
                let _ = reply.send(self.reject(&reason));
            }
            Command::Terminate { cause, reply } => {
                let _ = reply.send(self.terminate(cause));
            }
            Command::ReportMediaFailure { message, reply } => {
                let _ = reply.send(self.report_media_failure(&message));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.session().cloned());
            }
            Command::Inbound(signal) => self.handle_signal(signal).await,
            Command::Timer(fired) => self.on_timer(fired),
            Command::Provisioned(outcome) => self.on_provisioned(outcome),
            Command::Shutdown => return false,
        }
        true
    }
}

/// Handle to a running session loop.
pub struct CallManager {
    local: LocalIdentity,
    queue: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CallManager {
    /// Starts the session loop and the outbound writer on the current runtime.
    pub fn spawn(
        local: LocalIdentity,
        config: SignalingConfig,
        transport: Arc<dyn SignalTransport>,
        provisioner: Arc<dyn RoomProvisioner>,
        blocklist: Arc<BlocklistStore>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<RawSignal>();

        let mut machine = SessionMachine::new(
            local.clone(),
            config,
            blocklist,
            provisioner,
            outbox_tx,
            queue_tx.clone(),
        );
        let notifications = machine.notifications();

        let user_id = local.user_id.clone();
        let session_loop = tokio::spawn(async move {
            while let Some(command) = queue_rx.recv().await {
                if !machine.dispatch(command).await {
                    break;
                }
            }
            debug!(target: "Calls/Manager", "Session loop for {user_id} stopped");
        });

        // Sends go out in the order the machine produced them.
        let writer = tokio::spawn(async move {
            while let Some(signal) = outbox_rx.recv().await {
                if let Err(e) = transport.send(&signal).await {
                    warn!(
                        target: "Calls/Manager",
                        "Failed to send {} to {}: {e:#}",
                        signal.flag,
                        signal.payload.to.as_deref().unwrap_or("?")
                    );
                }
            }
        });

        info!(target: "Calls/Manager", "Call manager started for {}", local.user_id);
        Arc::new(Self {
            local,
            queue: queue_tx,
            notifications,
            tasks: std::sync::Mutex::new(vec![session_loop, writer]),
        })
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(command(tx))
            .map_err(|_| CallError::NotRunning)?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    pub async fn start_call(
        &self,
        callee_id: &str,
        media_type: MediaType,
        callee_role: ParticipantRole,
    ) -> Result<CallId, CallError> {
        self.request(|reply| Command::StartCall {
            callee_id: callee_id.to_string(),
            media_type,
            callee_role,
            reply,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await
    }

    pub async fn reject(&self, reason: &str) -> Result<(), CallError> {
        self.request(|reply| Command::Reject {
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    pub async fn cancel(&self) -> Result<TerminationReason, CallError> {
        self.terminate(EndCause::User).await
    }

    pub async fn terminate(&self, cause: EndCause) -> Result<TerminationReason, CallError> {
        self.request(|reply| Command::Terminate { cause, reply }).await
    }

    pub async fn report_media_failure(&self, message: &str) -> Result<(), CallError> {
        self.request(|reply| Command::ReportMediaFailure {
            message: message.to_string(),
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Option<CallSession>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Command::Snapshot(tx))
            .map_err(|_| CallError::NotRunning)?;
        rx.await.map_err(|_| CallError::NotRunning)
    }

    /// Queues an inbound signal for processing.
    pub fn deliver(&self, signal: RawSignal) -> Result<(), CallError> {
        self.queue
            .send(Command::Inbound(signal))
            .map_err(|_| CallError::NotRunning)
    }

    /// Forwards everything from `inbound` into the session loop.
    pub fn attach(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<RawSignal>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                if manager.deliver(signal).is_err() {
                    break;
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Stops the session loop. Pending timers and provisioning die with it.
    pub fn shutdown(&self) {
        let _ = self.queue.send(Command::Shutdown);
        if let Ok(mut tasks) = self.tasks.lock() {
            // The loop exits on its own; the rest only forward.
            for task in tasks.drain(1..) {
                task.abort();
            }
        }
        info!(target: "Calls/Manager", "Call manager for {} shut down", self.local.user_id);
    }
}
