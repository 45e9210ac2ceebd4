//! HTTP routes and handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use uuid::Uuid;

use super::broadcaster::{Delivery, EventBroadcaster, SubscriberRx};
use super::error::ApiError;
use super::protocol::{
    ChatRequest, HealthResponse, ProtocolError, ResetResponse, RunState, StatusResponse,
};
use crate::agent::{EventKind, ProcessSupervisor, StreamEvent};

/// Interval between SSE keep-alive comments
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ProcessSupervisor>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: Arc<ProcessSupervisor>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            supervisor,
            broadcaster,
            started_at: Instant::now(),
        }
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/chat", post(chat))
        .route("/events", get(events))
        .route("/status", get(status))
        .route("/reset", post(reset))
        .route("/health", get(health))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type EventStream = Sse<KeepAliveStream<stream::BoxStream<'static, Result<Event, Infallible>>>>;

/// `POST /chat`: run the agent on a message and stream its events
async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<EventStream, ApiError> {
    let Json(request) = payload.map_err(|e| ProtocolError::InvalidBody(e.body_text()))?;
    let message = request.validate()?;

    if !state.supervisor.is_alive().await {
        return Err(ApiError::service_unavailable("Agent supervisor is not running"));
    }

    let (client_id, rx) = state.broadcaster.subscribe();
    let guard = SubscriberGuard {
        id: client_id.clone(),
        broadcaster: Arc::clone(&state.broadcaster),
    };

    let job_id = match state.supervisor.send_message(message).await {
        Ok(completion) => Some(completion.job_id()),
        Err(e) => {
            warn!("Chat request from {} rejected: {}", client_id, e);
            state
                .broadcaster
                .send_to_one(&client_id, StreamEvent::error(e.to_string()));
            state.broadcaster.remove_subscriber(&client_id);
            None
        }
    };

    info!("Chat stream opened for {}", client_id);
    Ok(into_sse(chat_stream(rx, job_id, guard)))
}

/// `GET /events`: follow every event until the client disconnects
async fn events(State(state): State<AppState>) -> Result<EventStream, ApiError> {
    if !state.supervisor.is_alive().await {
        return Err(ApiError::service_unavailable("Agent supervisor is not running"));
    }

    let (client_id, rx) = state.broadcaster.subscribe();
    info!("Event stream opened for {}", client_id);
    let guard = SubscriberGuard {
        id: client_id,
        broadcaster: Arc::clone(&state.broadcaster),
    };
    Ok(into_sse(watch_stream(rx, guard)))
}

/// `GET /status`
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.supervisor.snapshot().await;
    Json(StatusResponse {
        status: if snapshot.is_some() {
            RunState::Running
        } else {
            RunState::Stopped
        },
        busy: snapshot.as_ref().is_some_and(|s| s.busy),
        sessions: snapshot.into_iter().collect(),
        subscribers: state.broadcaster.subscriber_count(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

/// `POST /reset`: stop any job and start a fresh conversation
async fn reset(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    let session_id = state.supervisor.reset().await?;
    state.broadcaster.broadcast(StreamEvent::status_with_detail(
        "reset",
        format!("New session {}", session_id),
    ));
    Ok(Json(ResetResponse::new(session_id)))
}

/// `GET /health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Removes its subscriber when the response stream is dropped
struct SubscriberGuard {
    id: String,
    broadcaster: Arc<EventBroadcaster>,
}

impl SubscriberGuard {
    fn close(&self) {
        if self.broadcaster.remove_subscriber(&self.id) {
            info!("Stream closed for {}", self.id);
        }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatPhase {
    /// Before the job's start marker; only the acknowledgement goes through
    Waiting,
    /// Forwarding the job's events
    Streaming,
}

struct ChatStreamState {
    rx: SubscriberRx,
    job_id: Option<Uuid>,
    phase: ChatPhase,
    guard: SubscriberGuard,
}

/// Events of one job, ending after its terminal event
///
/// Events from other jobs are skipped: the tail of a job that finished just
/// before this one started, and anything after this job's end marker. Without
/// a job the stream runs until the subscriber is removed.
fn chat_stream(
    rx: SubscriberRx,
    job_id: Option<Uuid>,
    guard: SubscriberGuard,
) -> impl Stream<Item = StreamEvent> {
    let state = ChatStreamState {
        rx,
        job_id,
        phase: if job_id.is_some() {
            ChatPhase::Waiting
        } else {
            ChatPhase::Streaming
        },
        guard,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            match state.rx.recv().await? {
                Delivery::Event(event) => {
                    if state.phase == ChatPhase::Streaming
                        || matches!(event.kind, EventKind::Connected { .. })
                    {
                        return Some((event, state));
                    }
                }
                Delivery::JobStarted(id) if state.job_id == Some(id) => {
                    state.phase = ChatPhase::Streaming;
                }
                Delivery::JobFinished(id) if state.job_id == Some(id) => {
                    state.guard.close();
                    return None;
                }
                Delivery::JobStarted(_) | Delivery::JobFinished(_) => {}
            }
        }
    })
}

/// Events until the subscriber is closed
fn watch_stream(rx: SubscriberRx, guard: SubscriberGuard) -> impl Stream<Item = StreamEvent> {
    stream::unfold((rx, guard), |(mut rx, guard)| async move {
        loop {
            if let Delivery::Event(event) = rx.recv().await? {
                return Some((event, (rx, guard)));
            }
        }
    })
}

fn into_sse(events: impl Stream<Item = StreamEvent> + Send + 'static) -> EventStream {
    let frames = events
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)))
        .boxed();
    Sse::new(frames).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .json_data(event)
        .unwrap_or_else(|e| {
            warn!("Failed to serialize stream event: {}", e);
            Event::default().event("error").data("{}")
        })
}
