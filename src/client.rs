use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{
    Archetype, ComparativeInsights, CompletionReceipt, EventReceipt, EventSubmission,
    HealthStatus, MatchList, MatchRequest, Profile, Recommendation, Session, SessionCompletion,
    SessionStart, ShareReceipt, ShareRequest, VersionInfo, Visualization,
};

/// Uniform failure of a user-facing API call. Displays as the message alone.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// No response was received.
    #[error("{message}")]
    Network { message: String },
    /// The server answered with a non-success status.
    #[error("{message}")]
    Application { status: u16, message: String },
    /// A success response whose body could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl ApiError {
    /// Build an application error from a status and raw body, preferring the
    /// server-supplied `error` or `message` field.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP {}", status));
        ApiError::Application { status, message }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Application { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Operations the client shell and tracker need from the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CognitiveApi: Send + Sync {
    /// Never fails; an unreachable backend reports `healthy: false`.
    async fn health_check(&self) -> HealthStatus;
    async fn version(&self) -> Result<VersionInfo, ApiError>;
    async fn create_session(&self, start: &SessionStart) -> Result<Session, ApiError>;
    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError>;
    /// Best-effort; failures are logged and yield `None`.
    async fn submit_event(&self, event: &EventSubmission) -> Option<EventReceipt>;
    async fn complete_session(
        &self,
        session_id: &str,
        final_state: &serde_json::Value,
    ) -> Result<CompletionReceipt, ApiError>;
    async fn comparative_insights(
        &self,
        user_id: &str,
        archetype: Option<Archetype>,
    ) -> Result<ComparativeInsights, ApiError>;
    async fn visualization(&self, session_id: &str) -> Result<Visualization, ApiError>;
    async fn share_profile(&self, profile: &Profile) -> Result<ShareReceipt, ApiError>;
    async fn find_matches(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<MatchList, ApiError>;
    async fn recommendation(&self, user_id: &str) -> Result<Recommendation, ApiError>;
}

/// HTTP client for the `/api` surface.
#[derive(Debug, Clone)]
pub struct CognitiveApiClient {
    client: Client,
    base_url: String,
}

impl CognitiveApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/api/{segments..}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| ApiError::Network {
            message: format!("invalid base url {}: {}", self.base_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Network {
                message: format!("base url cannot carry a path: {}", self.base_url),
            })?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await.map_err(|e| ApiError::Network {
            message: format!("network error: {}", e),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = ApiError::from_status(status.as_u16(), &body);
            debug!(status = status.as_u16(), error = %err, "API request failed");
            return Err(err);
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::InvalidResponse {
                message: e.to_string(),
            })
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        self.send(self.client.get(url)).await
    }

    async fn post<B: serde::Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(self.client.post(url).json(body)).await
    }
}

#[async_trait]
impl CognitiveApi for CognitiveApiClient {
    async fn health_check(&self) -> HealthStatus {
        let result = match self.url(&["health"]) {
            Ok(url) => self.get::<serde_json::Value>(url).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(details) => HealthStatus {
                healthy: true,
                error: None,
                details: Some(details),
            },
            Err(e) => {
                warn!(base_url = %self.base_url, error = %e, "health check failed");
                HealthStatus {
                    healthy: false,
                    error: Some(e.to_string()),
                    details: None,
                }
            }
        }
    }

    async fn version(&self) -> Result<VersionInfo, ApiError> {
        self.get(self.url(&["version"])?).await
    }

    async fn create_session(&self, start: &SessionStart) -> Result<Session, ApiError> {
        self.post(self.url(&["cognitive", "session", "start"])?, start)
            .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        self.get(self.url(&["cognitive", "session", session_id])?)
            .await
    }

    async fn submit_event(&self, event: &EventSubmission) -> Option<EventReceipt> {
        let result = match self.url(&["cognitive", "event"]) {
            Ok(url) => self.post::<_, EventReceipt>(url, event).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!(
                    session_id = %event.session_id,
                    event_type = %event.event_type,
                    error = %e,
                    "event tracking failed"
                );
                None
            }
        }
    }

    async fn complete_session(
        &self,
        session_id: &str,
        final_state: &serde_json::Value,
    ) -> Result<CompletionReceipt, ApiError> {
        let body = SessionCompletion {
            session_id: session_id.to_string(),
            final_state: final_state.clone(),
        };
        self.post(self.url(&["cognitive", "session", "complete"])?, &body)
            .await
    }

    async fn comparative_insights(
        &self,
        user_id: &str,
        archetype: Option<Archetype>,
    ) -> Result<ComparativeInsights, ApiError> {
        let mut url = self.url(&["cognitive", "comparative", user_id])?;
        if let Some(archetype) = archetype {
            url.query_pairs_mut()
                .append_pair("archetype", archetype.as_str());
        }
        self.get(url).await
    }

    async fn visualization(&self, session_id: &str) -> Result<Visualization, ApiError> {
        self.get(self.url(&["cognitive", "visualization", session_id])?)
            .await
    }

    async fn share_profile(&self, profile: &Profile) -> Result<ShareReceipt, ApiError> {
        let body = ShareRequest {
            profile: profile.clone(),
        };
        self.post(self.url(&["cognitive", "share"])?, &body).await
    }

    async fn find_matches(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<MatchList, ApiError> {
        let body = MatchRequest {
            user_id: user_id.to_string(),
            limit,
        };
        self.post(self.url(&["cognitive", "match"])?, &body).await
    }

    async fn recommendation(&self, user_id: &str) -> Result<Recommendation, ApiError> {
        self.get(self.url(&["cognitive", "recommendation", user_id])?)
            .await
    }
}
