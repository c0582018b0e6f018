//! End-to-end tests against an in-process fake Jupyter server.
//!
//! The supervised "server process" is a shell that announces the fake
//! server's URL on stderr and then sleeps; the REST and channels endpoints
//! are served by axum inside the test.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use docket_core::protocol::{KernelMessage, WireMessage};
use docket_core::{
    Error, ExecutionOutcome, ExpressionProbe, Insertion, Payload, Runner, RunnerConfig,
    ServerLaunch, ServerState, SourceSpan, StatusSink, Table, format,
};

/// Recorded traffic of the fake server.
#[derive(Default)]
struct FakeJupyter {
    kernels_created: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

type Shared = Arc<FakeJupyter>;

async fn create_kernel(
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let n = state.kernels_created.fetch_add(1, Ordering::SeqCst) + 1;
    let name = body["name"].as_str().unwrap_or("python3").to_string();
    (
        StatusCode::CREATED,
        Json(json!({
            "id": format!("kernel-{}", n),
            "name": name,
            "execution_state": "starting",
            "connections": 0,
        })),
    )
}

async fn delete_kernel(State(state): State<Shared>, Path(id): Path<String>) -> StatusCode {
    state.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

async fn create_notebook() -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({"name": "Untitled.ipynb", "path": "Untitled.ipynb", "type": "notebook"})),
    )
}

async fn create_session(
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.sessions.lock().unwrap().push(body.clone());
    (StatusCode::CREATED, Json(json!({"id": "session-1", "kernel": body["kernel"]})))
}

async fn channels(ws: WebSocketUpgrade, State(state): State<Shared>) -> Response {
    ws.on_upgrade(move |socket| kernel_loop(socket, state))
}

/// Answer each execute_request on its own task so overlapping requests
/// would be observable.
///
/// Code containing `hang` is never answered, `no_idle` gets no final idle
/// status and `drop_socket` closes the channel after the busy status.
async fn kernel_loop(socket: WebSocket, state: Shared) {
    let (mut sink, mut stream) = socket.split();
    // `None` closes the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some(frame) = frame else {
                let _ = sink.close().await;
                break;
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: WireMessage = serde_json::from_str(text.as_str()).unwrap();
        let code = request.content["code"].as_str().unwrap_or_default().to_string();
        state.executed.lock().unwrap().push(code.clone());

        let state = state.clone();
        let tx = tx.clone();
        let parent = request.msg_id().to_string();
        tokio::spawn(async move {
            if code.contains("hang") {
                return;
            }
            if code.contains("drop_socket") {
                let busy = iopub(&parent, "status", json!({"execution_state": "busy"}));
                let _ = tx.send(Some(busy.to_json().unwrap()));
                let _ = tx.send(None);
                return;
            }

            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if code.contains("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let mut frames = respond(&parent, &code);
            if code.contains("no_idle") {
                frames.pop();
            }
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            for frame in frames {
                let _ = tx.send(Some(frame.to_json().unwrap()));
            }
        });
    }

    writer.abort();
}

fn iopub(parent: &str, msg_type: &str, content: Value) -> WireMessage {
    KernelMessage::reply_frame(parent, msg_type, "iopub", content)
}

fn text_result(parent: &str, text: &str) -> WireMessage {
    iopub(
        parent,
        "execute_result",
        json!({"execution_count": 1, "data": {"text/plain": text}, "metadata": {}}),
    )
}

/// The kernel's behaviour, keyed on what the code looks like.
fn respond(parent: &str, code: &str) -> Vec<WireMessage> {
    let mut frames = vec![iopub(parent, "status", json!({"execution_state": "busy"}))];
    let mut reply = json!({"status": "ok", "execution_count": 1});

    if code.contains("raise") {
        frames.push(iopub(
            parent,
            "error",
            json!({"ename": "ValueError", "evalue": "bad value", "traceback": []}),
        ));
        reply = json!({"status": "error", "ename": "ValueError", "evalue": "bad value"});
    } else if code.contains("SELEC 1") {
        frames.push(text_result(
            parent,
            r#"'{"error": "Parser Error: syntax error at or near SELEC"}'"#,
        ));
    } else if code.contains("duckdb") {
        frames.push(text_result(
            parent,
            r#"'{"columns":["a","b"],"index":[0,1],"data":[["1","x"],["2","y"]]}'"#,
        ));
    } else if code.contains("print(") {
        frames.push(iopub(parent, "stream", json!({"name": "stdout", "text": "hi\n"})));
    } else if code.trim_end().ends_with("docket_final_result") {
        frames.push(iopub(
            parent,
            "display_data",
            json!({"data": {"text/html": "<b>shown</b>"}, "metadata": {}}),
        ));
        frames.push(text_result(parent, "2"));
    }

    frames.push(KernelMessage::reply_frame(parent, "execute_reply", "shell", reply));
    frames.push(iopub(parent, "status", json!({"execution_state": "idle"})));
    frames
}

struct FakeServer {
    state: Shared,
    port: u16,
    dir: tempfile::TempDir,
}

async fn start_fake() -> FakeServer {
    let state: Shared = Arc::new(FakeJupyter::default());
    let app = Router::new()
        .route("/api/kernels", post(create_kernel))
        .route("/api/kernels/{id}", delete(delete_kernel))
        .route("/api/kernels/{id}/channels", get(channels))
        .route("/api/contents", post(create_notebook))
        .route("/api/sessions", post(create_session))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeServer {
        state,
        port,
        dir: tempfile::tempdir().unwrap(),
    }
}

/// Treats the last line as an expression unless it assigns, raises or prints.
struct LastLineProbe;

impl ExpressionProbe for LastLineProbe {
    async fn trailing_expression(&self, code: &str) -> Option<SourceSpan> {
        let lines: Vec<&str> = code.lines().collect();
        let last = lines.last()?;
        if last.contains('=') || last.starts_with("raise") || last.starts_with("print(") {
            return None;
        }
        Some(SourceSpan {
            lineno: lines.len(),
            col_offset: 0,
            end_lineno: lines.len(),
            end_col_offset: last.len(),
        })
    }
}

#[derive(Default)]
struct Notices(Mutex<Vec<String>>, Mutex<Vec<String>>);

impl StatusSink for Notices {
    fn status(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }

    fn log(&self, message: &str) {
        self.1.lock().unwrap().push(message.to_string());
    }
}

fn runner_for(fake: &FakeServer, notices: Arc<Notices>) -> Runner<LastLineProbe> {
    let script = format!(
        "echo 'The Jupyter Notebook is running at:' >&2; \
         echo 'http://127.0.0.1:{}/' >&2; exec sleep 60",
        fake.port
    );
    let launch = ServerLaunch::command("/bin/sh", ["-c".to_string(), script], fake.dir.path());
    let config = RunnerConfig::for_workspace(fake.dir.path());
    Runner::with_parts(config, launch, LastLineProbe, notices).unwrap()
}

#[tokio::test]
async fn test_trailing_expression_value() {
    let fake = start_fake().await;
    let notices = Arc::new(Notices::default());
    let runner = runner_for(&fake, notices.clone());

    let outcome = runner
        .run_code("x = 1\n1 + 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Value(Payload::Scalar(json!(2))));
    assert_eq!(
        format(&outcome).unwrap(),
        Insertion::Block("<PyResult>\n2\n</PyResult>".to_string())
    );

    let executed = fake.state.executed.lock().unwrap().clone();
    assert!(executed[0].contains("x = 1"));
    assert!(executed[0].contains("docket_result = (\n1 + 1\n)"));

    let statuses = notices.0.lock().unwrap().clone();
    assert!(statuses.contains(&"Running Python code...".to_string()));
    assert!(statuses.contains(&"success; output inserted".to_string()));
    // HTML goes to the log only.
    let logs = notices.1.lock().unwrap().clone();
    assert!(logs.iter().any(|l| l.contains("shown")));

    runner.shutdown().await;
}

#[tokio::test]
async fn test_no_result_and_session_reuse() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    let outcome = runner
        .run_code("x = 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::NoResult);

    let outcome = runner
        .run_code("print(x)", docket_core::Language::General, true)
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::NoResult);

    // Both fragments ran on the same kernel, verbatim.
    assert_eq!(fake.state.kernels_created.load(Ordering::SeqCst), 1);
    let executed = fake.state.executed.lock().unwrap().clone();
    assert_eq!(executed, vec!["x = 1".to_string(), "print(x)".to_string()]);

    runner.shutdown().await;
}

#[tokio::test]
async fn test_kernel_error_is_execution_error() {
    let fake = start_fake().await;
    let notices = Arc::new(Notices::default());
    let runner = runner_for(&fake, notices.clone());

    let err = runner
        .run_code("raise ValueError('bad value')", docket_core::Language::General, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Execution(ref m) if m == "bad value"));

    // The session survives a failed fragment.
    let outcome = runner
        .run_code("1 + 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Value(_)));

    runner.shutdown().await;
}

#[tokio::test]
async fn test_tabular_query_and_query_error() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    let outcome = runner
        .run_code("SELECT * FROM t", docket_core::Language::Tabular, true)
        .await
        .unwrap();
    let expected = Table {
        columns: vec!["a".to_string(), "b".to_string()],
        rows: vec![vec![json!("1"), json!("x")], vec![json!("2"), json!("y")]],
    };
    assert_eq!(outcome, ExecutionOutcome::Value(Payload::Table(expected)));
    let Insertion::Block(block) = format(&outcome).unwrap() else {
        panic!("expected a block");
    };
    assert!(block.starts_with("<DataTable"));

    let outcome = runner
        .run_code("SELEC 1", docket_core::Language::Tabular, true)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Value(Payload::QueryError(
            "Parser Error: syntax error at or near SELEC".to_string()
        ))
    );

    runner.shutdown().await;
}

#[tokio::test]
async fn test_restart_replaces_kernel() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    runner
        .run_code("x = 1", docket_core::Language::General, true)
        .await
        .unwrap();
    let first = runner.sessions().current().await.unwrap().id().to_string();

    runner.restart().await.unwrap();
    let second = runner.sessions().current().await.unwrap().id().to_string();

    assert_ne!(first, second);
    assert_eq!(fake.state.deleted.lock().unwrap().clone(), vec![first]);
    assert_eq!(fake.state.kernels_created.load(Ordering::SeqCst), 2);

    let outcome = runner
        .run_code("1 + 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Value(_)));

    runner.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_serialized() {
    let fake = start_fake().await;
    let runner = Arc::new(runner_for(&fake, Arc::new(Notices::default())));

    let mut handles = Vec::new();
    for i in 0..3 {
        let runner = runner.clone();
        handles.push(tokio::spawn(async move {
            runner
                .run_code(
                    &format!("slow = {}\nslow", i),
                    docket_core::Language::General,
                    true,
                )
                .await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Value(_)));
    }

    // One server, one kernel, never more than one request in flight.
    assert_eq!(fake.state.kernels_created.load(Ordering::SeqCst), 1);
    assert_eq!(fake.state.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(fake.state.executed.lock().unwrap().len(), 3);

    runner.shutdown().await;
}

#[tokio::test]
async fn test_notebook_url_attaches_kernel() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    assert!(matches!(
        runner.notebook_url().await.unwrap_err(),
        Error::Connection(_)
    ));

    runner
        .run_code("x = 1", docket_core::Language::General, true)
        .await
        .unwrap();
    let url = runner.notebook_url().await.unwrap();
    assert_eq!(
        url.as_str(),
        format!("http://127.0.0.1:{}/notebooks/Untitled.ipynb", fake.port)
    );

    let sessions = fake.state.sessions.lock().unwrap().clone();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["kernel"]["id"], "kernel-1");
    assert_eq!(sessions[0]["type"], "notebook");

    runner.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    runner
        .run_code("x = 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert_eq!(runner.supervisor().state(), ServerState::Running);

    runner.shutdown().await;
    assert_eq!(runner.supervisor().state(), ServerState::Stopped);
    assert_eq!(fake.state.deleted.lock().unwrap().len(), 1);

    // Stopping twice is harmless.
    runner.shutdown().await;
}

#[tokio::test]
async fn test_restart_settles_request_in_flight() {
    let fake = start_fake().await;
    let runner = Arc::new(runner_for(&fake, Arc::new(Notices::default())));

    let pending = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run_code("hang = True", docket_core::Language::General, true)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.restart().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .expect("request in flight must settle on restart")
        .unwrap();
    assert!(matches!(result, Err(Error::Execution(ref m)) if m == "session restarted"));

    // The fresh kernel takes requests.
    let outcome = runner
        .run_code("1 + 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Value(_)));

    runner.shutdown().await;
}

#[tokio::test]
async fn test_reply_without_idle_settles_as_no_result() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    let outcome = tokio::time::timeout(
        Duration::from_secs(15),
        runner.run_code("no_idle = 1", docket_core::Language::General, true),
    )
    .await
    .expect("request without idle must settle")
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::NoResult);

    runner.shutdown().await;
}

#[tokio::test]
async fn test_channel_closed_mid_request_settles() {
    let fake = start_fake().await;
    let runner = runner_for(&fake, Arc::new(Notices::default()));

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner.run_code("drop_socket = 1", docket_core::Language::General, true),
    )
    .await
    .expect("request on a closed channel must settle")
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::NoResult);

    // The dead session is replaced on the next request.
    let outcome = runner
        .run_code("1 + 1", docket_core::Language::General, true)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Value(_)));
    assert_eq!(fake.state.kernels_created.load(Ordering::SeqCst), 2);

    runner.shutdown().await;
}
