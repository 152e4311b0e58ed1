//! Client application shell.
//!
//! [`AppContext`] owns everything the client needs (API handle, local
//! profile cache, tracker, current session) and runs start-up as a strict
//! sequence: health check → create or resume session → load or create
//! profile → initialize presentation → start tracking. The first failure
//! stops the sequence and leaves the context in [`ShellState::Failed`];
//! nothing from a failed attempt is kept. [`AppContext::retry`] reruns it.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{ApiError, CognitiveApi};
use crate::local_store::{LocalStoreError, ProfileCache};
use crate::models::{
    ComparativeInsights, CompletionReceipt, Profile, Recommendation, Session, SessionStart,
    SessionStatus, SessionSummary, ShareReceipt, Visualization,
};
use crate::tracker::{EventTracker, TrackerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellStep {
    HealthCheck,
    Session,
    Profile,
    Presentation,
    Tracking,
    Completion,
    Insights,
}

impl fmt::Display for ShellStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShellStep::HealthCheck => "health check",
            ShellStep::Session => "session",
            ShellStep::Profile => "profile",
            ShellStep::Presentation => "presentation",
            ShellStep::Tracking => "tracking",
            ShellStep::Completion => "completion",
            ShellStep::Insights => "insights",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{step} failed: {message}")]
pub struct ShellError {
    pub step: ShellStep,
    pub message: String,
}

impl ShellError {
    fn at(step: ShellStep) -> impl FnOnce(String) -> Self {
        move |message| ShellError { step, message }
    }
}

fn api_err(step: ShellStep) -> impl FnOnce(ApiError) -> ShellError {
    move |e| ShellError::at(step)(e.to_string())
}

fn store_err(step: ShellStep) -> impl FnOnce(LocalStoreError) -> ShellError {
    move |e| ShellError::at(step)(e.to_string())
}

/// What the user sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShellState {
    Uninitialized,
    Ready,
    /// Error state with a retry action.
    Failed { step: ShellStep, message: String },
}

/// Describes the session the client wants to play.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub puzzle_type: String,
    pub resolution: Option<String>,
    pub user_agent: Option<String>,
}

impl LaunchOptions {
    pub fn new(puzzle_type: impl Into<String>) -> Self {
        Self {
            puzzle_type: puzzle_type.into(),
            resolution: None,
            user_agent: Some(format!("cognitive-mirrors/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Everything a successful start-up produces.
struct Started {
    user_id: String,
    session: Session,
    profile: Profile,
    visualization: Visualization,
    tracker: EventTracker,
}

pub struct AppContext {
    api: Arc<dyn CognitiveApi>,
    cache: ProfileCache,
    launch: LaunchOptions,
    state: ShellState,
    started: Option<Started>,
}

impl AppContext {
    pub fn new(api: Arc<dyn CognitiveApi>, cache: ProfileCache, launch: LaunchOptions) -> Self {
        Self {
            api,
            cache,
            launch,
            state: ShellState::Uninitialized,
            started: None,
        }
    }

    pub fn state(&self) -> &ShellState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ShellState::Ready
    }

    pub fn user_id(&self) -> Option<&str> {
        self.started.as_ref().map(|s| s.user_id.as_str())
    }

    pub fn session(&self) -> Option<&Session> {
        self.started.as_ref().map(|s| &s.session)
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.started.as_ref().map(|s| &s.profile)
    }

    pub fn visualization(&self) -> Option<&Visualization> {
        self.started.as_ref().map(|s| &s.visualization)
    }

    /// Run the start-up sequence. All-or-nothing.
    pub async fn initialize(&mut self) -> Result<(), ShellError> {
        if let Some(previous) = self.started.take() {
            previous.tracker.shutdown().await;
        }
        match self.start().await {
            Ok(started) => {
                info!(
                    user_id = %started.user_id,
                    session_id = %started.session.session_id,
                    "application ready"
                );
                self.started = Some(started);
                self.state = ShellState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(step = %e.step, error = %e.message, "application start-up failed");
                self.state = ShellState::Failed {
                    step: e.step,
                    message: e.message.clone(),
                };
                Err(e)
            }
        }
    }

    /// The retry action offered by the error state.
    pub async fn retry(&mut self) -> Result<(), ShellError> {
        info!("retrying start-up");
        self.initialize().await
    }

    async fn start(&self) -> Result<Started, ShellError> {
        let health = self.api.health_check().await;
        if !health.healthy {
            return Err(ShellError {
                step: ShellStep::HealthCheck,
                message: health
                    .error
                    .unwrap_or_else(|| "backend unavailable".to_string()),
            });
        }

        let user_id = self.cache.user_id().map_err(store_err(ShellStep::Session))?;
        let session = self.resume_or_create(&user_id).await?;

        let profile = self
            .cache
            .load_user_profile(&user_id)
            .map_err(store_err(ShellStep::Profile))?;

        let visualization = self
            .api
            .visualization(&session.session_id)
            .await
            .map_err(api_err(ShellStep::Presentation))?;

        let mut tracker = EventTracker::new(self.api.clone());
        tracker.start(&session);

        Ok(Started {
            user_id,
            session,
            profile,
            visualization,
            tracker,
        })
    }

    /// Reuse the remembered session if the server still has it active for
    /// this user; otherwise start a new one and remember it.
    async fn resume_or_create(&self, user_id: &str) -> Result<Session, ShellError> {
        let step = ShellStep::Session;
        if let Some(last) = self.cache.last_session().map_err(store_err(step))? {
            match self.api.get_session(&last).await {
                Ok(session) if session.user_id == user_id && !session.is_completed() => {
                    info!(session_id = %last, "resuming session");
                    return Ok(session);
                }
                Ok(_) => info!(session_id = %last, "remembered session is not resumable"),
                Err(e) if e.status() == Some(404) => {
                    info!(session_id = %last, "remembered session no longer exists")
                }
                Err(e) => return Err(api_err(step)(e)),
            }
        }

        let start = SessionStart {
            user_id: user_id.to_string(),
            puzzle_type: self.launch.puzzle_type.clone(),
            resolution: self.launch.resolution.clone(),
            user_agent: self.launch.user_agent.clone(),
        };
        let session = self
            .api
            .create_session(&start)
            .await
            .map_err(api_err(step))?;
        if session.session_id.is_empty() {
            return Err(ShellError::at(step)("server issued an empty session id".into()));
        }
        self.cache
            .set_last_session(&session.session_id)
            .map_err(store_err(step))?;
        Ok(session)
    }

    /// Forward an interaction event. Never fails; returns whether it was queued.
    pub fn track(&self, event_type: &str, data: serde_json::Value) -> bool {
        match self.started.as_ref() {
            Some(started) => started.tracker.track(event_type, data),
            None => false,
        }
    }

    /// Complete the current session, record it in the cached profile, and
    /// adopt the archetype the server assigned.
    pub async fn complete(
        &mut self,
        final_state: serde_json::Value,
    ) -> Result<CompletionReceipt, ShellError> {
        let step = ShellStep::Completion;
        let started = self
            .started
            .as_mut()
            .ok_or_else(|| ShellError::at(step)("no active session".into()))?;
        if started.session.is_completed() {
            return Err(ShellError::at(step)("session already completed".into()));
        }

        let receipt = self
            .api
            .complete_session(&started.session.session_id, &final_state)
            .await
            .map_err(api_err(step))?;

        // The server no longer accepts events for this session.
        let completed_at = Utc::now();
        started.session.status = SessionStatus::Completed;
        started.session.completed_at = Some(completed_at);
        started.session.final_state = Some(final_state);
        started.session.metrics = Some(receipt.metrics.clone());
        started.tracker.stop();

        let summary = SessionSummary {
            session_id: receipt.session_id.clone(),
            puzzle_type: started.session.puzzle_type.clone(),
            completed_at,
            score: receipt.metrics.score,
        };
        let mut profile = self
            .cache
            .record_session(&started.user_id, summary)
            .map_err(store_err(step))?;
        if receipt.archetype.is_some() {
            profile.archetype = receipt.archetype;
            self.cache.save_profile(&profile).map_err(store_err(step))?;
        }
        self.cache.clear_last_session().map_err(store_err(step))?;

        started.profile = profile;
        info!(
            session_id = %receipt.session_id,
            archetype = ?receipt.archetype,
            "session completed"
        );
        Ok(receipt)
    }

    pub async fn insights(&self) -> Result<ComparativeInsights, ShellError> {
        let started = self.require_started()?;
        self.api
            .comparative_insights(&started.user_id, started.profile.archetype)
            .await
            .map_err(api_err(ShellStep::Insights))
    }

    pub async fn recommendation(&self) -> Result<Recommendation, ShellError> {
        let started = self.require_started()?;
        self.api
            .recommendation(&started.user_id)
            .await
            .map_err(api_err(ShellStep::Insights))
    }

    pub async fn share_profile(&self) -> Result<ShareReceipt, ShellError> {
        let started = self.require_started()?;
        self.api
            .share_profile(&started.profile)
            .await
            .map_err(api_err(ShellStep::Insights))
    }

    fn require_started(&self) -> Result<&Started, ShellError> {
        self.started.as_ref().ok_or_else(|| ShellError {
            step: ShellStep::Insights,
            message: "application is not initialized".into(),
        })
    }

    /// Stop tracking and wait for queued events to drain.
    pub async fn shutdown(mut self) -> Option<TrackerStats> {
        match self.started.take() {
            Some(started) => Some(started.tracker.shutdown().await),
            None => None,
        }
    }
}
