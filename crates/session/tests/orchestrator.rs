//! End-to-end orchestrator tests against an in-process fake backend.
//!
//! The fake serves the endpoints the orchestrator touches: `/prompt`,
//! `/upload/image`, `/history/{id}`, and the `/ws` push channel. Each
//! test configures the fake's behavior (push frames, when outputs
//! appear, whether polls fail) and observes the event stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use fluxdeck_comfyui::{ComfyUIApi, ComfyUIClient};
use fluxdeck_core::types::{GenerationParams, WorkflowMode};
use fluxdeck_history::local::HistoryFile;
use fluxdeck_history::HistoryStore;
use fluxdeck_session::{Orchestrator, SessionConfig, SessionError, SessionEvent, SourceImage};

const PROMPT_ID: &str = "fake-prompt-1";
const UPLOADED_NAME: &str = "edit-src.png";

struct FakeBackend {
    /// Push frames sent to the client right after the WS handshake.
    ws_frames: Vec<String>,
    /// Drop the WS connection after sending the frames (otherwise it
    /// stays open for the life of the test).
    ws_close_after_frames: bool,
    /// Number of `/history/{id}` polls that see no outputs before the
    /// job appears finished.
    polls_before_outputs: usize,
    /// Make every `/history/{id}` poll return HTTP 500.
    fail_polls: bool,
    /// Delay applied before every `/history/{id}` response.
    poll_delay: Duration,
    /// Images reported under the finished job's output node.
    output_filenames: Vec<&'static str>,
    poll_count: AtomicUsize,
    submitted: Mutex<Vec<serde_json::Value>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            ws_frames: Vec::new(),
            ws_close_after_frames: false,
            polls_before_outputs: 0,
            fail_polls: false,
            poll_delay: Duration::ZERO,
            output_filenames: vec!["out.png"],
            poll_count: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

async fn serve(state: Arc<FakeBackend>) -> String {
    let app = Router::new()
        .route("/prompt", post(submit_handler))
        .route("/upload/image", post(upload_handler))
        .route("/history/{id}", get(history_handler))
        .route("/ws", any(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

async fn submit_handler(
    State(state): State<Arc<FakeBackend>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    state.submitted.lock().await.push(body);
    Json(serde_json::json!({ "prompt_id": PROMPT_ID, "number": 0 }))
}

async fn upload_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": UPLOADED_NAME, "subfolder": "", "type": "input" }))
}

async fn history_handler(
    State(state): State<Arc<FakeBackend>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let polls = state.poll_count.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.poll_delay).await;
    if state.fail_polls {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ledger unavailable").into_response();
    }
    if polls <= state.polls_before_outputs {
        return Json(serde_json::json!({})).into_response();
    }
    let images: Vec<serde_json::Value> = state
        .output_filenames
        .iter()
        .map(|name| {
            serde_json::json!({
                "filename": name, "subfolder": "generated/create", "type": "output"
            })
        })
        .collect();
    Json(serde_json::json!({
        id: { "outputs": { "9": { "images": images } } }
    }))
    .into_response()
}

async fn ws_handler(State(state): State<Arc<FakeBackend>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| drive_ws(socket, state))
}

async fn drive_ws(mut socket: WebSocket, state: Arc<FakeBackend>) {
    for frame in &state.ws_frames {
        if socket.send(WsMessage::Text(frame.clone().into())).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if state.ws_close_after_frames {
        return;
    }
    std::future::pending::<()>().await;
}

// ---- test harness ----

struct Harness {
    orchestrator: Orchestrator,
    history: Arc<HistoryStore>,
    backend: Arc<FakeBackend>,
    _dir: tempfile::TempDir,
}

async fn harness(backend: FakeBackend, config: SessionConfig) -> Harness {
    let backend = Arc::new(backend);
    let addr = serve(Arc::clone(&backend)).await;

    let dir = tempfile::tempdir().unwrap();
    let history = Arc::new(HistoryStore::open(HistoryFile::new(
        dir.path().join("history.json"),
    )));
    let api = Arc::new(ComfyUIApi::new(format!("http://{addr}")));
    let client = ComfyUIClient::new(format!("ws://{addr}"));
    let orchestrator = Orchestrator::new(api, client, Arc::clone(&history), config);

    Harness {
        orchestrator,
        history,
        backend,
        _dir: dir,
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(30),
        timeout: Duration::from_secs(5),
    }
}

fn create_params() -> GenerationParams {
    GenerationParams {
        mode: WorkflowMode::Create,
        prompt: "a lighthouse at dusk".to_string(),
        steps: 20,
        seed: 42,
        cfg: 1.0,
        guidance: 3.5,
        width: 1024,
        height: 1024,
        loras: Vec::new(),
    }
}

fn edit_params() -> GenerationParams {
    GenerationParams {
        mode: WorkflowMode::Edit,
        prompt: "make it snow".to_string(),
        steps: 20,
        seed: 7,
        cfg: 1.0,
        guidance: 2.5,
        width: 1024,
        height: 1024,
        loras: Vec::new(),
    }
}

fn progress_frame(value: u32, max: u32) -> String {
    format!(r#"{{"type":"progress","data":{{"value":{value},"max":{max}}}}}"#)
}

/// Drain events until a terminal one arrives, returning everything seen.
async fn collect_until_terminal(
    rx: &mut broadcast::Receiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no terminal event within 10s")
            .expect("event channel closed");
        let terminal = matches!(
            event,
            SessionEvent::Completed { .. }
                | SessionEvent::Failed { .. }
                | SessionEvent::TimedOut
                | SessionEvent::Cancelled
        );
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

// ---- tests ----

#[tokio::test]
async fn create_job_completes_and_records_history() {
    let h = harness(
        FakeBackend {
            ws_frames: vec![
                r#"{"type":"execution_start","data":{"prompt_id":"fake-prompt-1"}}"#.to_string(),
                progress_frame(5, 20),
                progress_frame(20, 20),
            ],
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    let prompt_id = h.orchestrator.submit(create_params(), None).await.unwrap();
    assert_eq!(prompt_id, PROMPT_ID);

    let events = collect_until_terminal(&mut rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Submitted { prompt_id } if prompt_id == PROMPT_ID)));

    let SessionEvent::Completed { entries } = events.last().unwrap() else {
        panic!("expected Completed, got {:?}", events.last());
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "out.png");
    assert_eq!(entries[0].prompt, "a lighthouse at dusk");
    assert_eq!(entries[0].seed, 42);
    assert!(entries[0].url.contains("filename=out.png"));

    let stored = h.history.entries();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].url, entries[0].url);

    // The submission carried the sampler node and the correlation id.
    let submitted = h.backend.submitted.lock().await;
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].pointer("/prompt/31/inputs/seed").is_some());
    assert!(submitted[0]
        .get("client_id")
        .and_then(|v| v.as_str())
        .is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn progress_events_are_forwarded() {
    let h = harness(
        FakeBackend {
            ws_frames: vec![progress_frame(10, 20)],
            polls_before_outputs: 2,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { value, max, fraction } => Some((*value, *max, *fraction)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(10, 20, 0.5)]);
}

#[tokio::test]
async fn channel_close_does_not_complete_session() {
    // WS drops immediately; outputs only appear on the third poll. The
    // session must keep polling and complete from the ledger alone.
    let h = harness(
        FakeBackend {
            ws_close_after_frames: true,
            polls_before_outputs: 2,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(
        events.last().unwrap(),
        SessionEvent::Completed { .. }
    ));
    assert!(h.backend.poll_count.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn failed_poll_fails_the_session() {
    let h = harness(
        FakeBackend {
            fail_polls: true,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    let SessionEvent::Failed { reason } = events.last().unwrap() else {
        panic!("expected Failed, got {:?}", events.last());
    };
    assert!(reason.contains("500"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn execution_error_fails_the_session() {
    let h = harness(
        FakeBackend {
            ws_frames: vec![
                r#"{"type":"execution_error","data":{"prompt_id":"fake-prompt-1","node_id":"31","exception_message":"out of memory","exception_type":"RuntimeError"}}"#
                    .to_string(),
            ],
            polls_before_outputs: usize::MAX,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    let SessionEvent::Failed { reason } = events.last().unwrap() else {
        panic!("expected Failed, got {:?}", events.last());
    };
    assert!(reason.contains("RuntimeError"));
    assert!(reason.contains("out of memory"));
}

#[tokio::test]
async fn session_times_out_without_outputs() {
    let h = harness(
        FakeBackend {
            polls_before_outputs: usize::MAX,
            ..Default::default()
        },
        SessionConfig {
            poll_interval: Duration::from_millis(30),
            timeout: Duration::from_millis(150),
        },
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap(), SessionEvent::TimedOut));
    assert!(h.history.is_empty());
}

#[tokio::test]
async fn cancel_ends_the_session_without_history() {
    let h = harness(
        FakeBackend {
            polls_before_outputs: usize::MAX,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    h.orchestrator.cancel().await;
    // cancel is idempotent
    h.orchestrator.cancel().await;

    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap(), SessionEvent::Cancelled));
    assert!(h.history.is_empty());
}

#[tokio::test]
async fn second_submission_is_rejected_then_slot_is_reclaimed() {
    let h = harness(
        FakeBackend {
            polls_before_outputs: usize::MAX,
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    assert!(h.orchestrator.is_active().await);

    let err = h.orchestrator.submit(create_params(), None).await;
    assert!(matches!(err, Err(SessionError::AlreadyRunning)));

    h.orchestrator.cancel().await;
    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap(), SessionEvent::Cancelled));

    // The finished session's slot no longer blocks a new submission.
    let mut rx = h.orchestrator.events();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orchestrator.submit(create_params(), None).await.unwrap();
    h.orchestrator.cancel().await;
    collect_until_terminal(&mut rx).await;
}

#[tokio::test]
async fn edit_uploads_source_then_references_it() {
    let h = harness(FakeBackend::default(), fast_config()).await;

    let mut rx = h.orchestrator.events();
    let source = SourceImage {
        filename: "local.png".to_string(),
        bytes: vec![0x89, 0x50, 0x4e, 0x47],
    };
    h.orchestrator
        .submit(edit_params(), Some(source))
        .await
        .unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Uploaded { name } if name == UPLOADED_NAME)));

    // The edit graph must reference the server-side name, not the
    // local filename.
    let submitted = h.backend.submitted.lock().await;
    assert_eq!(
        submitted[0].pointer("/prompt/142/inputs/image"),
        Some(&serde_json::json!(UPLOADED_NAME))
    );

    let SessionEvent::Completed { entries } = events.last().unwrap() else {
        panic!("expected Completed");
    };
    assert_eq!(entries[0].mode, WorkflowMode::Edit);
    assert_eq!(entries[0].edit_prompt.as_deref(), Some("make it snow"));
}

#[tokio::test]
async fn edit_without_source_image_is_rejected_before_side_effects() {
    let h = harness(FakeBackend::default(), fast_config()).await;

    let err = h.orchestrator.submit(edit_params(), None).await;
    assert!(matches!(err, Err(SessionError::MissingSourceImage)));
    assert!(h.backend.submitted.lock().await.is_empty());
    assert!(!h.orchestrator.is_active().await);
}

#[tokio::test]
async fn cancel_during_inflight_poll_discards_the_result() {
    // The ledger replies with outputs only after a long delay. Cancel
    // lands while that poll is in flight; the session must end as
    // Cancelled and the late result must never publish Completed or
    // touch the history.
    let h = harness(
        FakeBackend {
            poll_delay: Duration::from_millis(300),
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.orchestrator.cancel().await;

    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap(), SessionEvent::Cancelled));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::Completed { .. })));

    // Wait out the poll's reply window; nothing further may arrive.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(h.history.is_empty());
}

#[tokio::test]
async fn deadline_fires_while_a_poll_hangs() {
    // A hung ledger request must not stall the session deadline.
    let h = harness(
        FakeBackend {
            poll_delay: Duration::from_secs(60),
            ..Default::default()
        },
        SessionConfig {
            poll_interval: Duration::from_millis(30),
            timeout: Duration::from_millis(400),
        },
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap(), SessionEvent::TimedOut));
    assert!(h.history.is_empty());
}

#[tokio::test]
async fn only_the_first_output_image_becomes_the_result() {
    let h = harness(
        FakeBackend {
            output_filenames: vec!["first.png", "second.png"],
            ..Default::default()
        },
        fast_config(),
    )
    .await;

    let mut rx = h.orchestrator.events();
    h.orchestrator.submit(create_params(), None).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let SessionEvent::Completed { entries } = events.last().unwrap() else {
        panic!("expected Completed, got {:?}", events.last());
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "first.png");
    assert_eq!(h.history.len(), 1);
}

#[tokio::test]
async fn invalid_parameters_are_rejected_before_side_effects() {
    let h = harness(FakeBackend::default(), fast_config()).await;

    let mut params = create_params();
    params.width = 0;
    let err = h.orchestrator.submit(params, None).await;
    assert!(matches!(err, Err(SessionError::InvalidParameters(_))));
    assert!(h.backend.submitted.lock().await.is_empty());
}
