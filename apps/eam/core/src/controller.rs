//! Request handling: decodes inbound messages, drives operator lifecycles and
//! reports results back through the [`Broadcaster`].

use std::{sync::Arc, time::Duration};

use tokio::{sync::OwnedMutexGuard, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::ProtocolError,
    message::{
        Message, MessageKind, NoData, TaskerRef, ACTION_START, ACTION_STOP, EVENT_COMPLETED,
        EVENT_INVALID_MESSAGE, EVENT_UNKNOWN_EVENT, EVENT_UNKNOWN_MESSAGE_TYPE,
        EVENT_UNKNOWN_RESPONSE_ACTION,
    },
    operator::{Operator, RunOutcome},
    registry::{ActiveRun, OperatorHandle, OperatorRegistry},
};

pub type ConnectionId = Uuid;

/// Outbound side of the transport.
pub trait Broadcaster: Send + Sync {
    /// Queues `payload` for one connection. Returns `false` if it is gone.
    fn send(&self, peer: ConnectionId, payload: Vec<u8>) -> bool;

    /// Queues `payload` for every live connection and returns how many
    /// accepted it.
    fn broadcast(&self, payload: Vec<u8>) -> usize;
}

pub const MSG_DECODE_FAILED: &str = "Failed to decode request data.";
pub const MSG_EMPTY_ID: &str = "Tasker ID is empty.";
pub const MSG_NO_OPERATOR: &str = "Operator does not exist.";
pub const MSG_ALREADY_RUNNING: &str = "Operator is already running.";
pub const MSG_NOT_RUNNING: &str = "Operator is not running.";
pub const MSG_STOP_FAILED: &str = "Failed to stop tasker.";
pub const MSG_SHUTTING_DOWN: &str = "Server is shutting down.";
pub const MSG_UNKNOWN_ACTION: &str = "Unknown request action.";

/// Reply to an inbound message plus the run it started, if any.
pub struct Dispatched {
    pub reply: Message,
    pub run: Option<PendingRun>,
}

impl Dispatched {
    fn reply(reply: Message) -> Self {
        Self { reply, run: None }
    }
}

/// A started run that has not been spawned yet. Holds the operator's
/// lifecycle lock until it finishes; dropping it unlaunched tears the
/// operator down.
pub struct PendingRun {
    tasker_id: String,
    handle: Arc<OperatorHandle>,
    guard: Option<OwnedMutexGuard<Operator>>,
    token: CancellationToken,
    broadcaster: Arc<dyn Broadcaster>,
    tracker: TaskTracker,
}

impl PendingRun {
    pub fn tasker_id(&self) -> &str {
        &self.tasker_id
    }

    /// Spawns the task sequence. On natural completion a `completed` event
    /// is broadcast; the operator is destroyed whatever the outcome.
    pub fn launch(mut self) -> JoinHandle<()> {
        let guard = self.guard.take();
        let tasker_id = self.tasker_id.clone();
        let handle = Arc::clone(&self.handle);
        let token = self.token.clone();
        let broadcaster = Arc::clone(&self.broadcaster);

        self.tracker.spawn(async move {
            let Some(mut operator) = guard else {
                return;
            };
            match operator.run(&token).await {
                RunOutcome::Completed(report) => {
                    let event = Message::event(EVENT_COMPLETED, "", &TaskerRef::new(&tasker_id));
                    let delivered = broadcaster.broadcast(event.to_bytes());
                    info!(
                        tasker_id = %tasker_id,
                        succeeded = report.succeeded.len(),
                        failed = report.failed.len(),
                        delivered,
                        "run completed"
                    );
                }
                RunOutcome::Cancelled(report) => {
                    info!(
                        tasker_id = %tasker_id,
                        attempted = report.attempted(),
                        total = report.total,
                        "run cancelled"
                    );
                }
                RunOutcome::Failed(err) => {
                    error!(tasker_id = %tasker_id, error = %err, "run failed");
                }
            }
            operator.destroy();
            handle.disarm();
        })
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if let Some(mut operator) = self.guard.take() {
            warn!(tasker_id = %self.tasker_id, "run dropped before launch");
            operator.destroy();
            self.handle.disarm();
        }
    }
}

pub struct SessionController {
    registry: Arc<OperatorRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    runs: TaskTracker,
}

impl SessionController {
    pub fn new(registry: Arc<OperatorRegistry>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
            runs: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    /// Handles one inbound frame from `peer`: the reply is queued before any
    /// run it started is spawned.
    pub async fn handle(&self, peer: ConnectionId, raw: &[u8]) {
        let Dispatched { reply, run } = self.dispatch(raw).await;
        if !self.broadcaster.send(peer, reply.to_bytes()) {
            debug!(peer = %peer, "reply dropped; connection gone");
        }
        if let Some(run) = run {
            run.launch();
        }
    }

    pub async fn dispatch(&self, raw: &[u8]) -> Dispatched {
        match Message::from_slice(raw) {
            Ok(msg) => self.process(msg).await,
            Err(err) => {
                warn!(error = %err, bytes = raw.len(), "invalid message");
                Dispatched::reply(Message::event(
                    EVENT_INVALID_MESSAGE,
                    "Failed to decode message.",
                    &NoData {},
                ))
            }
        }
    }

    pub async fn process(&self, msg: Message) -> Dispatched {
        match msg.kind() {
            MessageKind::Request => self.handle_request(msg).await,
            MessageKind::Response => {
                warn!(action = msg.action(), "unexpected response from client");
                Dispatched::reply(Message::event(
                    EVENT_UNKNOWN_RESPONSE_ACTION,
                    "Unknown response action.",
                    &NoData {},
                ))
            }
            MessageKind::Event => {
                warn!(event = msg.event_name(), "unexpected event from client");
                Dispatched::reply(Message::event(
                    EVENT_UNKNOWN_EVENT,
                    "Unknown event.",
                    &NoData {},
                ))
            }
            MessageKind::Unknown => {
                warn!("message with unknown type");
                Dispatched::reply(Message::event(
                    EVENT_UNKNOWN_MESSAGE_TYPE,
                    "Unknown message type.",
                    &NoData {},
                ))
            }
        }
    }

    async fn handle_request(&self, msg: Message) -> Dispatched {
        info!(action = msg.action(), "request");
        match msg.action() {
            ACTION_START => self.start(&msg).await,
            ACTION_STOP => Dispatched::reply(self.stop(&msg).await),
            other => {
                warn!(action = other, "unknown request action");
                Dispatched::reply(Message::failure(other, MSG_UNKNOWN_ACTION))
            }
        }
    }

    fn lookup(&self, msg: &Message) -> Result<Arc<OperatorHandle>, ProtocolError> {
        let target: TaskerRef = msg.decode_data()?;
        if target.tasker_id.is_empty() {
            return Err(ProtocolError::Validation(MSG_EMPTY_ID));
        }
        self.registry
            .get(&target.tasker_id)
            .ok_or(ProtocolError::Validation(MSG_NO_OPERATOR))
    }

    async fn start(&self, msg: &Message) -> Dispatched {
        let handle = match self.lookup(msg) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "start rejected");
                return Dispatched::reply(Message::failure(ACTION_START, err.client_message()));
            }
        };
        if self.runs.is_closed() {
            return Dispatched::reply(Message::failure(ACTION_START, MSG_SHUTTING_DOWN));
        }
        let Some(mut operator) = handle.try_acquire() else {
            warn!(tasker_id = %handle.id(), "start rejected; operator busy");
            return Dispatched::reply(Message::failure(ACTION_START, MSG_ALREADY_RUNNING));
        };

        if let Err(err) = operator.activate().await {
            error!(tasker_id = %handle.id(), error = %err, "activation failed");
            operator.destroy();
            return Dispatched::reply(Message::failure(ACTION_START, err.client_message()));
        }
        let Some(stopper) = operator.stopper() else {
            operator.destroy();
            return Dispatched::reply(Message::failure(ACTION_START, "Failed to init tasker."));
        };

        let token = CancellationToken::new();
        handle.arm(ActiveRun {
            token: token.clone(),
            stopper,
        });
        // A shutdown that began during activation may have swept the handles
        // before this run was armed.
        if self.runs.is_closed() {
            warn!(tasker_id = %handle.id(), "start abandoned; shutdown began during activation");
            handle.disarm();
            operator.destroy();
            return Dispatched::reply(Message::failure(ACTION_START, MSG_SHUTTING_DOWN));
        }
        info!(tasker_id = %handle.id(), "run armed");
        Dispatched {
            reply: Message::success(ACTION_START),
            run: Some(PendingRun {
                tasker_id: handle.id().to_string(),
                handle: Arc::clone(&handle),
                guard: Some(operator),
                token,
                broadcaster: Arc::clone(&self.broadcaster),
                tracker: self.runs.clone(),
            }),
        }
    }

    async fn stop(&self, msg: &Message) -> Message {
        let handle = match self.lookup(msg) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "stop rejected");
                return Message::failure(ACTION_STOP, err.client_message());
            }
        };
        let Some(run) = handle.active_run() else {
            return Message::failure(ACTION_STOP, MSG_NOT_RUNNING);
        };
        if run.stopper.stop(&run.token).await {
            info!(tasker_id = %handle.id(), "stop acknowledged");
            Message::success(ACTION_STOP)
        } else {
            error!(tasker_id = %handle.id(), "engine refused stop");
            Message::failure(ACTION_STOP, MSG_STOP_FAILED)
        }
    }

    /// Refuses new runs, stops every live one and waits up to `grace` for the
    /// run tasks to finish. Returns `false` if some were still running.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.runs.close();
        for handle in self.registry.handles() {
            if let Some(run) = handle.active_run() {
                info!(tasker_id = %handle.id(), "stopping run for shutdown");
                run.stopper.stop(&run.token).await;
            }
        }
        let drained = tokio::time::timeout(grace, self.runs.wait()).await.is_ok();
        if !drained {
            warn!(
                remaining = self.runs.len(),
                "runs still active after shutdown grace"
            );
        }
        drained
    }
}
