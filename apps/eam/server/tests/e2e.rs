use std::{net::SocketAddr, sync::Arc, time::Duration};

use eam_client::{bare_request, ClientError, ControlClient};
use eam_core::{
    config::AppConfig,
    engine::scripted::ScriptedEngine,
    message::{TaskerRef, EVENT_COMPLETED},
    MessageKind, RunOutcome, Status,
};
use eam_server::{
    build_state,
    routes::{OperatorSummary, PidValidation, PONG},
    run::{run_once, summary},
    serve_with_shutdown,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

const CONFIG: &str = r#"
[[taskers]]
id = "a"
name = "daily"
controller = { type = "adb", serial = "127.0.0.1:16384" }
tasks = [
    { entry = "Wake" },
    { entry = "Collect", param = { times = 2 } },
]

[[taskers]]
id = "slow"
name = "forever"
controller = { type = "adb", serial = "127.0.0.1:16416" }
tasks = [{ entry = "Hold" }]
"#;

struct Server {
    addr: SocketAddr,
    engine: ScriptedEngine,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    async fn spawn() -> Self {
        let config = AppConfig::from_toml_str(CONFIG).unwrap();
        let engine = ScriptedEngine::new()
            .with_task_delay(Duration::from_millis(20))
            .block_entry("Hold");
        let state = build_state(&config, Arc::new(engine.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve_with_shutdown(
            listener,
            state,
            async move {
                let _ = stopped.await;
            },
            Duration::from_secs(2),
        ));
        Self {
            addr,
            engine,
            stop: Some(stop),
            task,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn start_replies_then_broadcasts_completion() {
    let server = Server::spawn().await;
    let mut client = ControlClient::connect(&server.ws_url()).await.unwrap();
    let mut observer = ControlClient::connect(&server.ws_url()).await.unwrap();

    let reply = client.start("a").await.unwrap();
    assert_eq!(reply.kind(), MessageKind::Response);
    assert_eq!(reply.status(), Some(Status::Success));

    let done = observer.wait_completed("a").await.unwrap();
    assert_eq!(done.event_name(), EVENT_COMPLETED);
    let data: TaskerRef = done.decode_data().unwrap();
    assert_eq!(data.tasker_id, "a");
    client.wait_completed("a").await.unwrap();

    let submitted = server.engine.journal().submitted;
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[1].0, "Collect");
    assert_eq!(submitted[1].1, r#"{"times":2}"#);

    client.close().await.unwrap();
    observer.close().await.unwrap();
    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn unknown_action_and_garbage_keep_the_connection_open() {
    let server = Server::spawn().await;
    let mut client = ControlClient::connect(&server.ws_url()).await.unwrap();

    client.send(&bare_request("bogus")).await.unwrap();
    let reply = client.next_message().await.unwrap();
    assert_eq!(reply.status(), Some(Status::Error));
    assert_eq!(reply.message(), "Unknown request action.");

    client.send_raw("{not json").await.unwrap();
    let event = client.next_message().await.unwrap();
    assert_eq!(event.kind(), MessageKind::Event);
    assert_eq!(event.event_name(), "InvalidMessage");

    match client.start("missing").await {
        Err(ClientError::Rejected { message, .. }) => {
            assert_eq!(message, "Operator does not exist.")
        }
        other => panic!("unexpected result: {other:?}"),
    }

    client.close().await.unwrap();
    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn stop_over_the_wire_cancels_a_blocked_run() {
    let server = Server::spawn().await;
    let mut client = ControlClient::connect(&server.ws_url()).await.unwrap();

    client.start("slow").await.unwrap();
    match client.start("slow").await {
        Err(ClientError::Rejected { message, .. }) => {
            assert_eq!(message, "Operator is already running.")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    client.stop("slow").await.unwrap();
    assert_eq!(server.engine.journal().stop_requests, 1);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn shutdown_stops_live_runs() {
    let server = Server::spawn().await;
    let mut client = ControlClient::connect(&server.ws_url()).await.unwrap();
    client.start("slow").await.unwrap();

    let engine = server.engine.clone();
    server.shutdown().await;
    assert_eq!(engine.journal().stop_requests, 1);
    assert_eq!(engine.live_handles(), 0);
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn shutdown_sends_a_close_frame_to_clients() {
    let server = Server::spawn().await;
    let mut client = ControlClient::connect(&server.ws_url()).await.unwrap();
    client.start("a").await.unwrap();

    server.shutdown().await;
    let ended = loop {
        match client.next_message().await {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(ended, ClientError::Closed), "{ended:?}");
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn http_endpoints() {
    let server = Server::spawn().await;
    let http = reqwest::Client::new();

    let pong = http.get(server.http("/ping")).send().await.unwrap();
    assert_eq!(pong.text().await.unwrap(), PONG);
    let pong = http.post(server.http("/ping")).send().await.unwrap();
    assert_eq!(pong.text().await.unwrap(), PONG);

    let own = http
        .post(server.http("/pid/validate"))
        .json(&serde_json::json!({ "pid": std::process::id() }))
        .send()
        .await
        .unwrap();
    assert_eq!(own.status(), 200);
    assert!(own.json::<PidValidation>().await.unwrap().validated);

    let negative = http
        .post(server.http("/pid/validate"))
        .json(&serde_json::json!({ "pid": -3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(negative.status(), 400);
    assert!(!negative.json::<PidValidation>().await.unwrap().validated);

    let operators: Vec<OperatorSummary> = http
        .get(server.http("/api/operators"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = operators.iter().map(|op| op.id.as_str()).collect();
    assert_eq!(ids, ["a", "slow"]);
    assert!(operators.iter().all(|op| !op.running));

    let versions: serde_json::Value = http
        .get(server.http("/api/versions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(versions["eam"], env!("CARGO_PKG_VERSION"));
    assert!(versions["engine"]
        .as_str()
        .unwrap()
        .starts_with("scripted-"));

    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn one_shot_run_completes() {
    let config = AppConfig::from_toml_str(CONFIG).unwrap();
    let engine = ScriptedEngine::new();
    let outcome = run_once(
        &config,
        Arc::new(engine.clone()),
        None,
        Some("daily"),
        std::future::pending(),
    )
    .await
    .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(ref report) if report.succeeded.len() == 2));
    assert_eq!(summary(&outcome), "Completed");
    assert_eq!(engine.live_handles(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn one_shot_run_interrupt_cancels() {
    let config = AppConfig::from_toml_str(CONFIG).unwrap();
    let engine = ScriptedEngine::new().block_entry("Hold");
    let outcome = run_once(
        &config,
        Arc::new(engine.clone()),
        Some("slow"),
        None,
        tokio::time::sleep(Duration::from_millis(50)),
    )
    .await
    .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled(_)));
    assert_eq!(summary(&outcome), "Interrupt");
    assert_eq!(engine.journal().stop_requests, 1);
}

#[test_timeout::tokio_timeout_test]
async fn one_shot_run_rejects_unknown_tasker() {
    let config = AppConfig::from_toml_str(CONFIG).unwrap();
    let result = run_once(
        &config,
        Arc::new(ScriptedEngine::new()),
        Some("nope"),
        None,
        std::future::pending(),
    )
    .await;
    assert!(result.is_err());
}
