use std::{path::PathBuf, sync::Arc, time::Duration};

use eam_core::{
    config::{AdbDevice, ControllerConfig, TaskConfig, TaskerProfile},
    controller::{
        MSG_ALREADY_RUNNING, MSG_NOT_RUNNING, MSG_NO_OPERATOR, MSG_SHUTTING_DOWN,
        MSG_STOP_FAILED,
    },
    engine::scripted::{ScriptedEngine, Stage},
    message::{TaskerRef, EVENT_COMPLETED},
    Broadcaster, ConnectionId, Message, MessageKind, Operator, OperatorEnv, OperatorRegistry,
    SessionController, Status,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Records outbound frames in order; `None` marks a broadcast.
struct Recorder {
    tx: mpsc::UnboundedSender<(Option<ConnectionId>, Vec<u8>)>,
}

impl Broadcaster for Recorder {
    fn send(&self, peer: ConnectionId, payload: Vec<u8>) -> bool {
        self.tx.send((Some(peer), payload)).is_ok()
    }

    fn broadcast(&self, payload: Vec<u8>) -> usize {
        usize::from(self.tx.send((None, payload)).is_ok())
    }
}

struct Harness {
    controller: SessionController,
    frames: mpsc::UnboundedReceiver<(Option<ConnectionId>, Vec<u8>)>,
    engine: ScriptedEngine,
    peer: ConnectionId,
}

impl Harness {
    fn new(engine: ScriptedEngine, taskers: &[(&str, &[&str])]) -> Self {
        let env = Arc::new(OperatorEnv {
            engine: Arc::new(engine.clone()),
            resource_dir: PathBuf::from("resource/base"),
            agent_dir: PathBuf::from("MaaAgentBinary"),
            adb_path: PathBuf::from("adb"),
            user_dir: PathBuf::from("log"),
        });
        let registry = Arc::new(OperatorRegistry::new());
        for (id, tasks) in taskers {
            let profile = TaskerProfile {
                id: id.to_string(),
                name: String::new(),
                controller: ControllerConfig::Adb(AdbDevice {
                    serial: "127.0.0.1:5555".into(),
                    ..AdbDevice::default()
                }),
                tasks: tasks.iter().map(|entry| TaskConfig::new(*entry)).collect(),
            };
            assert!(registry.add(Operator::new(profile, Arc::clone(&env))));
        }
        let (tx, frames) = mpsc::unbounded_channel();
        let controller = SessionController::new(registry, Arc::new(Recorder { tx }));
        Self {
            controller,
            frames,
            engine,
            peer: Uuid::new_v4(),
        }
    }

    async fn send(&self, value: Value) {
        let raw = serde_json::to_vec(&value).unwrap();
        self.controller.handle(self.peer, &raw).await;
    }

    async fn next(&mut self) -> (Option<ConnectionId>, Value) {
        let (target, bytes) = self.frames.recv().await.expect("recorder closed");
        (target, serde_json::from_slice(&bytes).unwrap())
    }

    async fn reply(&mut self) -> Value {
        let (target, value) = self.next().await;
        assert_eq!(target, Some(self.peer), "expected a direct reply, got {value}");
        value
    }
}

fn request(action: &str, tasker_id: &str) -> Value {
    json!({ "type": "request", "action": action, "data": { "tasker_id": tasker_id } })
}

#[test_timeout::tokio_timeout_test]
async fn start_replies_success_then_broadcasts_completed() {
    let mut h = Harness::new(ScriptedEngine::new(), &[("a", &["T1", "T2"])]);
    h.send(request("start", "a")).await;

    let reply = h.reply().await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["action"], "start");
    assert_eq!(reply["status"], "success");

    let (target, event) = h.next().await;
    assert_eq!(target, None);
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], EVENT_COMPLETED);
    assert_eq!(event["data"], json!({ "tasker_id": "a" }));
    assert_eq!(h.engine.journal().completed, vec!["T1", "T2"]);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_operator_is_an_error_without_side_effects() {
    let mut h = Harness::new(ScriptedEngine::new(), &[("a", &["T1"])]);
    for action in ["start", "stop"] {
        h.send(request(action, "ghost")).await;
        let reply = h.reply().await;
        assert_eq!(reply["action"], action);
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["message"], MSG_NO_OPERATOR);
    }
    h.send(request("start", "")).await;
    assert_eq!(h.reply().await["message"], "Tasker ID is empty.");

    h.send(json!({ "type": "request", "action": "start", "data": { "tasker_id": 5 } }))
        .await;
    assert_eq!(h.reply().await["message"], "Failed to decode request data.");

    assert!(h.engine.journal().submitted.is_empty());
    assert_eq!(h.engine.live_handles(), 0);
    assert!(!h.controller.registry().get("a").unwrap().is_running());
}

#[test_timeout::tokio_timeout_test]
async fn bogus_action_gets_error_response() {
    let mut h = Harness::new(ScriptedEngine::new(), &[]);
    h.send(json!({ "type": "request", "action": "bogus" })).await;
    let reply = h.reply().await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["action"], "bogus");
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Unknown request action.");
}

#[test_timeout::tokio_timeout_test]
async fn unexpected_inbound_messages_degrade_to_events() {
    let mut h = Harness::new(ScriptedEngine::new(), &[]);
    let cases = [
        (
            json!({ "type": "response", "action": "start", "status": "success" }),
            "UnknownResponseAction",
        ),
        (json!({ "type": "event", "event": "completed" }), "UnknownEvent"),
        (json!({ "type": "telegram" }), "UnknownMessageType"),
    ];
    for (inbound, expected) in cases {
        h.send(inbound).await;
        let reply = h.reply().await;
        assert_eq!(reply["type"], "event");
        assert_eq!(reply["event"], expected);
    }

    h.controller.handle(h.peer, b"\x00not json").await;
    assert_eq!(h.reply().await["event"], "InvalidMessage");
}

#[test_timeout::tokio_timeout_test(flavor = "multi_thread")]
async fn stop_before_any_task_completes_cancels_the_run() {
    let engine = ScriptedEngine::new().block_entry("T1");
    let mut h = Harness::new(engine, &[("a", &["T1", "T2"])]);
    h.send(request("start", "a")).await;
    assert_eq!(h.reply().await["status"], "success");

    while h.engine.journal().submitted.is_empty() {
        tokio::task::yield_now().await;
    }
    h.send(request("stop", "a")).await;
    let reply = h.reply().await;
    assert_eq!(reply["action"], "stop");
    assert_eq!(reply["status"], "success");

    assert!(h.controller.shutdown(Duration::from_secs(5)).await);
    let journal = h.engine.journal();
    assert!(journal.completed.is_empty());
    assert_eq!(journal.submitted.len(), 1);
    assert_eq!(h.engine.live_handles(), 0);
    assert!(
        h.frames.try_recv().is_err(),
        "a cancelled run must not broadcast completed"
    );
}

#[test_timeout::tokio_timeout_test]
async fn failing_task_still_completes_the_run() {
    let engine = ScriptedEngine::new().fail_entry("T2");
    let mut h = Harness::new(engine, &[("a", &["T1", "T2", "T3"])]);
    h.send(request("start", "a")).await;
    assert_eq!(h.reply().await["status"], "success");

    let (target, event) = h.next().await;
    assert_eq!(target, None);
    assert_eq!(event["event"], EVENT_COMPLETED);
    assert_eq!(h.engine.journal().submitted_entries(), vec!["T1", "T2", "T3"]);
    assert_eq!(h.engine.journal().completed, vec!["T1", "T3"]);
}

#[test_timeout::tokio_timeout_test(flavor = "multi_thread")]
async fn distinct_operators_run_concurrently() {
    let engine = ScriptedEngine::new().with_task_delay(Duration::from_millis(20));
    let mut h = Harness::new(engine, &[("a", &["A1", "A2"]), ("b", &["B1"])]);
    h.send(request("start", "a")).await;
    h.send(request("start", "b")).await;

    let mut replies = 0;
    let mut completed = Vec::new();
    while completed.len() < 2 {
        let (target, frame) = h.next().await;
        match target {
            Some(_) => {
                assert_eq!(frame["status"], "success");
                replies += 1;
            }
            None => {
                assert!(replies > 0, "completed observed before any success reply");
                let done: TaskerRef = serde_json::from_value(frame["data"].clone()).unwrap();
                completed.push(done.tasker_id);
            }
        }
    }
    completed.sort();
    assert_eq!(replies, 2);
    assert_eq!(completed, vec!["a", "b"]);
}

#[test_timeout::tokio_timeout_test(flavor = "multi_thread")]
async fn second_start_for_a_running_operator_is_rejected() {
    let engine = ScriptedEngine::new().block_entry("Loop");
    let mut h = Harness::new(engine, &[("a", &["Loop"])]);
    h.send(request("start", "a")).await;
    assert_eq!(h.reply().await["status"], "success");

    h.send(request("start", "a")).await;
    let reply = h.reply().await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], MSG_ALREADY_RUNNING);

    assert!(h.controller.shutdown(Duration::from_secs(5)).await);
    assert_eq!(h.engine.live_handles(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn stop_without_a_run_is_an_explicit_error() {
    let mut h = Harness::new(ScriptedEngine::new(), &[("a", &["T1"])]);
    h.send(request("stop", "a")).await;
    let reply = h.reply().await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], MSG_NOT_RUNNING);
    assert_eq!(h.engine.journal().stop_requests, 0);
}

#[test_timeout::tokio_timeout_test(flavor = "multi_thread")]
async fn malformed_stop_does_not_cancel_a_live_run() {
    let engine = ScriptedEngine::new().with_task_delay(Duration::from_millis(50));
    let mut h = Harness::new(engine, &[("a", &["T1", "T2"])]);
    h.send(request("start", "a")).await;
    assert_eq!(h.reply().await["status"], "success");

    h.send(json!({ "type": "request", "action": "stop", "data": {} }))
        .await;
    assert_eq!(h.reply().await["status"], "error");

    let (target, event) = h.next().await;
    assert_eq!(target, None);
    assert_eq!(event["event"], EVENT_COMPLETED);
    assert_eq!(h.engine.journal().stop_requests, 0);
}

#[test_timeout::tokio_timeout_test]
async fn activation_failure_reports_stage_and_destroys() {
    let engine = ScriptedEngine::new().fail_stage(Stage::Connect);
    let mut h = Harness::new(engine, &[("a", &["T1"])]);
    h.send(request("start", "a")).await;
    let reply = h.reply().await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Failed to connect device.");
    assert_eq!(h.engine.live_handles(), 0);
    assert!(!h.controller.registry().get("a").unwrap().is_running());
}

#[test_timeout::tokio_timeout_test]
async fn operator_can_be_started_again_after_completion() {
    let mut h = Harness::new(ScriptedEngine::new(), &[("a", &["T1"])]);
    for _ in 0..2 {
        h.send(request("start", "a")).await;
        assert_eq!(h.reply().await["status"], "success");
        let (_, event) = h.next().await;
        assert_eq!(event["event"], EVENT_COMPLETED);
        // The run task tears down after broadcasting; wait for it to let go.
        drop(h.controller.registry().get("a").unwrap().acquire().await);
    }
    assert_eq!(h.engine.journal().completed, vec!["T1", "T1"]);
}

#[test_timeout::tokio_timeout_test]
async fn dispatch_exposes_reply_without_launching() {
    let h = Harness::new(ScriptedEngine::new(), &[("a", &["T1"])]);
    let raw = serde_json::to_vec(&request("start", "a")).unwrap();
    let dispatched = h.controller.dispatch(&raw).await;
    assert_eq!(dispatched.reply.kind(), MessageKind::Response);
    assert_eq!(dispatched.reply.status(), Some(Status::Success));
    let run = dispatched.run.expect("start should produce a run");
    assert_eq!(run.tasker_id(), "a");
    assert!(h.controller.registry().get("a").unwrap().is_running());

    // Dropping an unlaunched run releases the operator.
    drop(run);
    assert!(!h.controller.registry().get("a").unwrap().is_running());
    assert_eq!(h.engine.live_handles(), 0);
    assert!(h.engine.journal().submitted.is_empty());

    let reply = Message::from_slice(&dispatched.reply.to_bytes()).unwrap();
    assert_eq!(reply.action(), "start");
}

#[test_timeout::tokio_timeout_test(flavor = "multi_thread")]
async fn refused_stop_is_reported_and_the_run_still_winds_down() {
    let engine = ScriptedEngine::new().block_entry("Loop").refuse_stop();
    let mut h = Harness::new(engine, &[("a", &["Loop", "After"])]);
    h.send(request("start", "a")).await;
    assert_eq!(h.reply().await["status"], "success");

    while h.engine.journal().submitted.is_empty() {
        tokio::task::yield_now().await;
    }
    h.send(request("stop", "a")).await;
    let reply = h.reply().await;
    assert_eq!(reply["action"], "stop");
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], MSG_STOP_FAILED);

    let handle = h.controller.registry().get("a").unwrap();
    drop(handle.acquire().await);
    assert!(!handle.is_running());
    assert_eq!(h.engine.journal().submitted_entries(), vec!["Loop"]);
    assert_eq!(h.engine.live_handles(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_during_activation_abandons_the_start() {
    let engine = ScriptedEngine::new().with_connect_delay(Duration::from_millis(200));
    let h = Harness::new(engine, &[("a", &["T1"])]);
    let raw = serde_json::to_vec(&request("start", "a")).unwrap();

    let (dispatched, drained) = tokio::join!(h.controller.dispatch(&raw), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.controller.shutdown(Duration::from_secs(1)).await
    });

    assert!(drained);
    assert!(dispatched.run.is_none());
    assert_eq!(dispatched.reply.status(), Some(Status::Error));
    assert_eq!(dispatched.reply.message(), MSG_SHUTTING_DOWN);
    assert!(!h.controller.registry().get("a").unwrap().is_running());
    assert!(h.engine.journal().submitted.is_empty());
    assert_eq!(h.engine.live_handles(), 0);
}
