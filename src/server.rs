//! Axum HTTP server for the Cognitive Mirrors API.
//!
//! ## Endpoints (all JSON, under `/api`)
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Liveness plus connection and session counts |
//! | GET | `/version` | Package name and version |
//! | POST | `/cognitive/session/start` | Start a session |
//! | GET | `/cognitive/session/:sessionId` | Fetch a session |
//! | POST | `/cognitive/event` | Record an interaction event |
//! | POST | `/cognitive/session/complete` | Complete a session, score it |
//! | GET | `/cognitive/comparative/:userId` | Compare a user against the population |
//! | GET | `/cognitive/visualization/:sessionId` | Event-transition network |
//! | POST | `/cognitive/share` | Mirror a profile server-side |
//! | POST | `/cognitive/match` | Rank similar shared profiles |
//! | GET | `/cognitive/recommendation/:userId` | Next puzzle suggestion |
//!
//! The realtime relay is mounted at `GET /ws`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        rejection::JsonRejection, ws::WebSocketUpgrade, ConnectInfo, Path, Query, Request,
        State,
    },
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{HeuristicEngine, PsychologyEngine};
use crate::models::{
    Archetype, ComparativeInsights, CompletionReceipt, EventReceipt, EventSubmission, MatchList,
    MatchRequest, Profile, Recommendation, Session, SessionCompletion, SessionMetrics,
    SessionStart, ShareReceipt, ShareRequest, VersionInfo, Visualization,
};
use crate::rate_limit::RateLimiter;
use crate::relay::{self, ConnectionManager};
use crate::store::{DocumentStore, StoreError};

const DEFAULT_MATCH_LIMIT: usize = 10;
const MAX_MATCH_LIMIT: usize = 50;

/// Resources owned by the running server, shared with every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub engine: Arc<dyn PsychologyEngine>,
    pub relay: Arc<ConnectionManager>,
    pub limiter: Arc<RateLimiter>,
    pub puzzles: Arc<Vec<String>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: DocumentStore,
        engine: Arc<dyn PsychologyEngine>,
        limiter: RateLimiter,
        puzzles: Vec<String>,
    ) -> Self {
        Self {
            store: Arc::new(store),
            engine,
            relay: Arc::new(ConnectionManager::new()),
            limiter: Arc::new(limiter),
            puzzles: Arc::new(puzzles),
            started_at: Instant::now(),
        }
    }

    /// Build state from configuration: journaled store if a data directory
    /// is set, heuristic engine, configured rate limit and catalog.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = match config.storage.data_dir.as_deref() {
            Some(dir) => DocumentStore::open(dir)?,
            None => {
                warn!("no storage.data_dir configured, sessions are memory-only");
                DocumentStore::in_memory()
            }
        };
        Ok(Self::new(
            store,
            Arc::new(HeuristicEngine::new()),
            RateLimiter::from_config(&config.rate_limit),
            config.puzzles.clone(),
        ))
    }

    /// Release owned resources: close relay connections, flush the journal.
    pub async fn shutdown(&self) {
        self.relay.close_all();
        if let Err(e) = self.store.flush().await {
            error!(error = %e, "failed to flush document store");
        }
    }
}

pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .route("/cognitive/session/start", post(handle_start_session))
        .route("/cognitive/session/complete", post(handle_complete_session))
        .route("/cognitive/session/:session_id", get(handle_get_session))
        .route("/cognitive/event", post(handle_event))
        .route("/cognitive/comparative/:user_id", get(handle_comparative))
        .route("/cognitive/visualization/:session_id", get(handle_visualization))
        .route("/cognitive/share", post(handle_share))
        .route("/cognitive/match", post(handle_match))
        .route("/cognitive/recommendation/:user_id", get(handle_recommendation))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(handle_ws))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}

/// Run the server until Ctrl+C, then release resources.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config)?;
    let app = create_router(state.clone(), &config.server.cors_origins);

    let pruner = {
        let limiter = state.limiter.clone();
        let every = Duration::from_secs(config.rate_limit.window_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                limiter.prune_idle();
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "cognitive mirrors server listening");

    let connections = state.relay.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        // Upgraded sockets are not tracked by graceful shutdown; close them here.
        connections.close_all();
    })
    .await?;

    pruner.abort();
    state.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// Error response rendered as `{ "error": message }`.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    message: String,
}

impl ApiFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::SessionNotFound { .. } | StoreError::ProfileNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StoreError::AlreadyCompleted { .. } | StoreError::SessionCompleted { .. } => {
                StatusCode::CONFLICT
            }
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) | StoreError::Serialization(_) => {
                error!(error = %err, "document store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiFailure {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiFailure>;

fn require(value: &str, field: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiFailure::bad_request(format!("{} is required", field)));
    }
    Ok(())
}

// ── Middleware ──────────────────────────────────────────────────────

/// Peer address, or the first forwarded hop when the proxy is trusted.
fn client_key(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
        {
            let forwarded = forwarded.trim();
            if !forwarded.is_empty() {
                return forwarded.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(&req, state.limiter.trusts_forwarded_for());
    if !state.limiter.check(&key) {
        return ApiFailure::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
            .into_response();
    }
    next.run(req).await
}

// ── Handlers ────────────────────────────────────────────────────────

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "connections": state.relay.connection_count(),
        "sessions": state.store.session_count().await,
    }))
}

async fn handle_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_start_session(
    State(state): State<AppState>,
    body: Result<Json<SessionStart>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let Json(start) = body?;
    let session = state.store.start_session(start).await?;
    info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        puzzle_type = %session.puzzle_type,
        "session started"
    );
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.store.get_session(&session_id).await?))
}

async fn handle_event(
    State(state): State<AppState>,
    body: Result<Json<EventSubmission>, JsonRejection>,
) -> ApiResult<Json<EventReceipt>> {
    let Json(submission) = body?;
    require(&submission.session_id, "sessionId")?;
    require(&submission.event_type, "eventType")?;

    let event = submission.into_event();
    let session_id = event.session_id.clone();
    let event_id = state.store.record_event(event).await?;
    relay::notify_session(&state.relay, &state.store, &session_id).await;
    Ok(Json(EventReceipt {
        success: true,
        event_id,
    }))
}

/// Archetype per user, from each user's completed sessions.
fn archetypes(
    engine: &dyn PsychologyEngine,
    completed: &HashMap<String, Vec<Session>>,
) -> HashMap<String, Archetype> {
    completed
        .iter()
        .filter_map(|(user_id, sessions)| {
            let history = metrics_of(sessions);
            engine
                .assign_archetype(&history)
                .map(|a| (user_id.clone(), a))
        })
        .collect()
}

fn metrics_of(sessions: &[Session]) -> Vec<SessionMetrics> {
    sessions.iter().filter_map(|s| s.metrics.clone()).collect()
}

async fn handle_complete_session(
    State(state): State<AppState>,
    body: Result<Json<SessionCompletion>, JsonRejection>,
) -> ApiResult<Json<CompletionReceipt>> {
    let Json(completion) = body?;
    require(&completion.session_id, "sessionId")?;

    let session = state.store.get_session(&completion.session_id).await?;
    if session.is_completed() {
        return Err(StoreError::AlreadyCompleted {
            session_id: session.session_id,
        }
        .into());
    }
    let events = state.store.events_for(&session.session_id).await?;
    let metrics = state
        .engine
        .score_session(&session, &events, &completion.final_state);

    // The store re-checks completion under its write lock.
    let completed = state
        .store
        .complete_session(&session.session_id, completion.final_state, metrics.clone())
        .await?;

    let history: Vec<SessionMetrics> = state
        .store
        .sessions_for_user(&completed.user_id)
        .await
        .into_iter()
        .filter_map(|s| s.metrics)
        .collect();
    let archetype = state.engine.assign_archetype(&history);

    relay::notify_session(&state.relay, &state.store, &completed.session_id).await;
    info!(
        session_id = %completed.session_id,
        events = metrics.event_count,
        archetype = ?archetype,
        "session scored"
    );
    Ok(Json(CompletionReceipt {
        success: true,
        session_id: completed.session_id,
        metrics,
        archetype,
    }))
}

#[derive(Deserialize)]
struct ComparativeQuery {
    archetype: Option<String>,
}

async fn handle_comparative(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ComparativeQuery>,
) -> ApiResult<Json<ComparativeInsights>> {
    let filter = match query.archetype.as_deref().filter(|a| !a.is_empty()) {
        Some(raw) => Some(raw.parse::<Archetype>().map_err(ApiFailure::bad_request)?),
        None => None,
    };

    let completed = state.store.completed_by_user().await;
    let assigned = archetypes(state.engine.as_ref(), &completed);

    let history = completed
        .get(&user_id)
        .map(|s| metrics_of(s))
        .unwrap_or_default();
    let population: Vec<SessionMetrics> = completed
        .iter()
        .filter(|(uid, _)| match filter {
            Some(wanted) => assigned.get(*uid) == Some(&wanted),
            None => true,
        })
        .flat_map(|(_, sessions)| metrics_of(sessions))
        .collect();

    let archetype = filter.or_else(|| assigned.get(&user_id).copied());
    Ok(Json(state.engine.comparative(
        &user_id,
        &history,
        &population,
        archetype,
    )))
}

async fn handle_visualization(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Visualization>> {
    let session = state.store.get_session(&session_id).await?;
    let events = state.store.events_for(&session_id).await?;
    Ok(Json(state.engine.visualize(&session, &events)))
}

async fn handle_share(
    State(state): State<AppState>,
    body: Result<Json<ShareRequest>, JsonRejection>,
) -> ApiResult<Json<ShareReceipt>> {
    let Json(request) = body?;
    let user_id = request.profile.user_id.clone();
    let share_id = state.store.share_profile(request.profile).await?;
    info!(user_id = %user_id, share_id = %share_id, "profile shared");
    Ok(Json(ShareReceipt {
        success: true,
        share_id,
    }))
}

async fn handle_match(
    State(state): State<AppState>,
    body: Result<Json<MatchRequest>, JsonRejection>,
) -> ApiResult<Json<MatchList>> {
    let Json(request) = body?;
    require(&request.user_id, "userId")?;
    let limit = request
        .limit
        .unwrap_or(DEFAULT_MATCH_LIMIT)
        .min(MAX_MATCH_LIMIT);

    let completed = state.store.completed_by_user().await;
    let assigned = archetypes(state.engine.as_ref(), &completed);
    // Server-side scoring wins over whatever archetype the client shared.
    let refresh = |mut profile: Profile| {
        if let Some(a) = assigned.get(&profile.user_id) {
            profile.archetype = Some(*a);
        }
        profile
    };

    let target = match state.store.shared_profile(&request.user_id).await {
        Ok(profile) => profile,
        Err(StoreError::ProfileNotFound { .. }) => Profile::new(request.user_id.clone()),
        Err(e) => return Err(e.into()),
    };
    let target = refresh(target);
    let candidates: Vec<Profile> = state
        .store
        .shared_profiles()
        .await
        .into_iter()
        .map(refresh)
        .collect();

    Ok(Json(MatchList {
        matches: state.engine.matches(&target, &candidates, limit),
    }))
}

async fn handle_recommendation(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Recommendation>> {
    let history = state.store.sessions_for_user(&user_id).await;
    Ok(Json(state.engine.recommend(
        &user_id,
        &history,
        &state.puzzles,
    )))
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let connections = state.relay.clone();
    let store = state.store.clone();
    ws.on_upgrade(move |socket| relay::serve_socket(socket, connections, store))
}
