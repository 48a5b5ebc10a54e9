//! Single-job session orchestrator.
//!
//! Drives one generation job end to end: upload (edit mode), workflow
//! submission correlated to a fresh push-channel connection, then a
//! tracking loop that merges push messages, ledger polls, the session
//! deadline, and the cancel token through the pure state machine in
//! [`crate::state`]. Completion is only ever declared from a ledger
//! poll that shows outputs.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use fluxdeck_comfyui::{
    messages, ComfyUIApi, ComfyUIApiError, ComfyUIClient, ComfyUIClientError, ComfyUIConnection,
    PushMessage,
};
use fluxdeck_core::error::CoreError;
use fluxdeck_core::types::{GenerationParams, HistoryEntry, WorkflowMode};
use fluxdeck_core::workflow::{build_create_workflow, build_edit_workflow};
use fluxdeck_history::{output_images, HistoryStore};

use crate::events::SessionEvent;
use crate::state::{transition, Input, Outcome, Phase};

/// Capacity of the session event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Timing knobs for the tracking loop.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between ledger polls.
    pub poll_interval: Duration,
    /// Deadline after which a session without outputs times out.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2500),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Errors surfaced by job submission.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A job is already in flight.
    #[error("A generation job is already running")]
    AlreadyRunning,

    /// Parameters failed validation before any side effect.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[from] CoreError),

    /// Edit mode was requested without a source image.
    #[error("Edit mode requires a source image")]
    MissingSourceImage,

    /// The source image upload failed.
    #[error("Image upload failed: {0}")]
    Upload(#[source] ComfyUIApiError),

    /// The push channel could not be established.
    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    /// The backend rejected the workflow submission.
    #[error("Workflow submission failed: {0}")]
    Submission(#[source] ComfyUIApiError),
}

/// Source image for an edit-mode job.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Orchestrates at most one generation job at a time.
pub struct Orchestrator {
    api: Arc<ComfyUIApi>,
    client: ComfyUIClient,
    history: Arc<HistoryStore>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<ActiveSession>>,
}

impl Orchestrator {
    pub fn new(
        api: Arc<ComfyUIApi>,
        client: ComfyUIClient,
        history: Arc<HistoryStore>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            client,
            history,
            config,
            events,
            active: Mutex::new(None),
        }
    }

    /// Subscribe to session lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether a job is currently in flight.
    pub async fn is_active(&self) -> bool {
        let active = self.active.lock().await;
        active.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Submit a generation job.
    ///
    /// Rejects with [`SessionError::AlreadyRunning`] before any side
    /// effect if a job is in flight; a finished slot is reclaimed.
    /// Returns the backend-assigned prompt id once the workflow has
    /// been accepted; tracking continues in a background task and
    /// reports through the event channel.
    pub async fn submit(
        &self,
        params: GenerationParams,
        source_image: Option<SourceImage>,
    ) -> Result<String, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if !session.task.is_finished() {
                return Err(SessionError::AlreadyRunning);
            }
            *active = None;
        }

        params.validate()?;

        let workflow = match params.mode {
            WorkflowMode::Create => build_create_workflow(&params)?,
            WorkflowMode::Edit => {
                let image = source_image.ok_or(SessionError::MissingSourceImage)?;
                let uploaded = self
                    .api
                    .upload_image(&image.filename, image.bytes)
                    .await
                    .map_err(SessionError::Upload)?;
                tracing::info!(name = %uploaded.name, "Uploaded edit source image");
                let _ = self.events.send(SessionEvent::Uploaded {
                    name: uploaded.name.clone(),
                });
                build_edit_workflow(&params, &uploaded.name)?
            }
        };

        let connection = self.client.connect().await?;
        let workflow_json = serde_json::to_value(&workflow)
            .map_err(|e| CoreError::Internal(format!("Workflow serialization failed: {e}")))?;
        let submitted = self
            .api
            .submit_workflow(&workflow_json, &connection.client_id)
            .await
            .map_err(SessionError::Submission)?;

        let prompt_id = submitted.prompt_id.clone();
        tracing::info!(prompt_id = %prompt_id, mode = params.mode.as_str(), "Workflow submitted");
        let _ = self.events.send(SessionEvent::Submitted {
            prompt_id: prompt_id.clone(),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(track_session(
            Arc::clone(&self.api),
            Arc::clone(&self.history),
            self.events.clone(),
            self.config.clone(),
            cancel.clone(),
            connection,
            prompt_id.clone(),
            params,
        ));
        *active = Some(ActiveSession { cancel, task });

        Ok(prompt_id)
    }

    /// Request cancellation of the in-flight job.
    ///
    /// Idempotent; a no-op when nothing is running.
    pub async fn cancel(&self) {
        let active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            session.cancel.cancel();
        }
    }
}

/// The tracking loop for one submitted job.
///
/// Ledger polls run as their own select branch, not inside a handler,
/// so an in-flight poll never blocks the cancel token or the deadline.
/// A poll result that resolves with outputs after cancellation was
/// requested is discarded.
#[allow(clippy::too_many_arguments)]
async fn track_session(
    api: Arc<ComfyUIApi>,
    history: Arc<HistoryStore>,
    events: broadcast::Sender<SessionEvent>,
    config: SessionConfig,
    cancel: CancellationToken,
    connection: ComfyUIConnection,
    prompt_id: String,
    params: GenerationParams,
) {
    let mut phase = Phase::Submitted;
    let mut ws = Some(connection.ws_stream);
    let mut inflight_poll: Option<PollFuture> = None;
    let mut confirmed: Vec<fluxdeck_history::OutputImage> = Vec::new();

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the backend has a poll
    // interval's worth of time before the first ledger read.
    poll.tick().await;

    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => Input::CancelRequested,
            _ = &mut deadline => Input::DeadlineElapsed,
            _ = poll.tick(), if inflight_poll.is_none() => {
                inflight_poll = Some(Box::pin(poll_ledger(
                    Arc::clone(&api),
                    prompt_id.clone(),
                )));
                continue;
            },
            result = poll_result(&mut inflight_poll), if inflight_poll.is_some() => {
                inflight_poll = None;
                match result {
                    Ok(Some(images)) if !cancel.is_cancelled() => {
                        confirmed = images;
                        Input::OutputsConfirmed
                    }
                    // Stale result: cancellation was requested while
                    // the poll was in flight.
                    Ok(Some(_)) => Input::CancelRequested,
                    Ok(None) => continue,
                    Err(e) => Input::PollFailed(e.to_string()),
                }
            },
            frame = next_frame(&mut ws), if ws.is_some() => match frame {
                Some(Ok(Message::Text(text))) => match messages::parse_message(&text) {
                    Ok(msg) => {
                        match push_input(&msg) {
                            Some(input) => {
                                if let PushMessage::Progress(data) = &msg {
                                    if !matches!(phase, Phase::Done(_)) {
                                        let _ = events.send(SessionEvent::Progress {
                                            value: data.value,
                                            max: data.max,
                                            fraction: data.fraction(),
                                        });
                                    }
                                }
                                input
                            }
                            None => continue,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring unrecognized push message");
                        continue;
                    }
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Push channel read failed, relying on polling");
                    ws = None;
                    Input::ChannelClosed
                }
                None => {
                    tracing::debug!("Push channel closed, relying on polling");
                    ws = None;
                    Input::ChannelClosed
                }
            },
        };

        phase = transition(&phase, &input);
        if let Phase::Done(outcome) = &phase {
            match outcome {
                Outcome::Completed => {
                    let entries =
                        record_outputs(&api, &history, &params, std::mem::take(&mut confirmed));
                    let _ = events.send(SessionEvent::Completed { entries });
                }
                Outcome::Failed(reason) => {
                    tracing::warn!(prompt_id = %prompt_id, reason = %reason, "Session failed");
                    let _ = events.send(SessionEvent::Failed {
                        reason: reason.clone(),
                    });
                }
                Outcome::TimedOut => {
                    tracing::warn!(prompt_id = %prompt_id, "Session timed out");
                    let _ = events.send(SessionEvent::TimedOut);
                }
                Outcome::Cancelled => {
                    tracing::info!(prompt_id = %prompt_id, "Session cancelled");
                    let _ = events.send(SessionEvent::Cancelled);
                }
            }
            break;
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type PollResult = Result<Option<Vec<fluxdeck_history::OutputImage>>, ComfyUIApiError>;
type PollFuture = Pin<Box<dyn Future<Output = PollResult> + Send>>;

async fn next_frame(
    ws: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match ws.as_mut() {
        Some(stream) => stream.next().await,
        // Guarded out by the select arm condition.
        None => std::future::pending().await,
    }
}

async fn poll_result(inflight: &mut Option<PollFuture>) -> PollResult {
    match inflight.as_mut() {
        Some(poll) => poll.await,
        // Guarded out by the select arm condition.
        None => std::future::pending().await,
    }
}

/// Map a push message to a state-machine input. `None` means the
/// message carries nothing the lifecycle cares about.
fn push_input(msg: &PushMessage) -> Option<Input> {
    match msg {
        PushMessage::Progress(_) => Some(Input::Progress),
        PushMessage::ExecutionStart(_) | PushMessage::ExecutionCached(_) => {
            Some(Input::NodeActivity)
        }
        PushMessage::Executing(data) => match data.node {
            Some(_) => Some(Input::NodeActivity),
            None => Some(Input::GraphFinished),
        },
        PushMessage::Executed(_) => Some(Input::NodeActivity),
        PushMessage::ExecutionError(data) => Some(Input::ExecutionErrored(format!(
            "{}: {}",
            if data.exception_type.is_empty() {
                "execution error"
            } else {
                &data.exception_type
            },
            data.exception_message
        ))),
        PushMessage::Status(_) => None,
    }
}

/// Poll the ledger for this job's outputs.
///
/// `Ok(Some(..))` when the job entry exists and carries at least one
/// output image; `Ok(None)` when the job has not finished yet.
async fn poll_ledger(api: Arc<ComfyUIApi>, prompt_id: String) -> PollResult {
    let ledger = api.get_history(&prompt_id).await?;
    let Some(job) = ledger.get(&prompt_id) else {
        return Ok(None);
    };
    let images = output_images(job);
    if images.is_empty() {
        Ok(None)
    } else {
        Ok(Some(images))
    }
}

/// Record the session result in the history store.
///
/// The first output image across the job's output nodes is the result;
/// any further images are ignored.
fn record_outputs(
    api: &ComfyUIApi,
    history: &HistoryStore,
    params: &GenerationParams,
    images: Vec<fluxdeck_history::OutputImage>,
) -> Vec<HistoryEntry> {
    let lora_settings = match params.mode {
        WorkflowMode::Create if !params.loras.is_empty() => Some(
            params
                .loras
                .iter()
                .map(|l| (l.name.clone(), l.setting))
                .collect::<BTreeMap<_, _>>(),
        ),
        _ => None,
    };

    let mut entries = Vec::new();
    for image in images.into_iter().take(1) {
        let url = match api.view_url(&image.filename, &image.subfolder, &image.file_type) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, filename = %image.filename, "Skipping output image");
                continue;
            }
        };
        let entry = HistoryEntry {
            url,
            timestamp: chrono::Utc::now(),
            prompt: params.prompt.clone(),
            seed: params.seed,
            steps: params.steps,
            guidance: params.guidance,
            mode: params.mode,
            filename: image.filename,
            width: params.width,
            height: params.height,
            lora_settings: lora_settings.clone(),
            edit_prompt: match params.mode {
                WorkflowMode::Edit => Some(params.prompt.clone()),
                WorkflowMode::Create => None,
            },
        };
        history.add(entry.clone());
        entries.push(entry);
    }
    entries
}
