//! Records shared by the server, the client, and the relay.
//!
//! All wire types use camelCase field names so the JSON matches what the
//! browser client sends and expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a puzzle session. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// One puzzle-solving interaction, from start to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub puzzle_type: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SessionMetrics>,
}

impl Session {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// Body of `POST /cognitive/session/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub user_id: String,
    pub puzzle_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl SessionStart {
    pub fn new(user_id: impl Into<String>, puzzle_type: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            puzzle_type: puzzle_type.into(),
            resolution: None,
            user_agent: None,
        }
    }
}

/// A single timestamped interaction fact. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub session_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Body of `POST /cognitive/event`. The timestamp defaults to receipt time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubmission {
    pub session_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventSubmission {
    pub fn into_event(self) -> Event {
        Event {
            session_id: self.session_id,
            event_type: self.event_type,
            payload: self.payload,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

impl From<&Event> for EventSubmission {
    fn from(event: &Event) -> Self {
        Self {
            session_id: event.session_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            timestamp: Some(event.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReceipt {
    pub success: bool,
    pub event_id: String,
}

/// Body of `POST /cognitive/session/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletion {
    pub session_id: String,
    #[serde(default)]
    pub final_state: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReceipt {
    pub success: bool,
    pub session_id: String,
    pub metrics: SessionMetrics,
    pub archetype: Option<Archetype>,
}

/// Derived per-session numbers produced by the psychology engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub event_count: u64,
    pub duration_secs: f64,
    pub mean_interval_secs: f64,
    pub distinct_event_types: u64,
    /// Share of events that undo or revise an earlier choice.
    pub revision_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Categorical label assigned to a user from accumulated sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Analyst,
    Explorer,
    Intuitive,
    Perfectionist,
}

impl Archetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::Analyst => "analyst",
            Archetype::Explorer => "explorer",
            Archetype::Intuitive => "intuitive",
            Archetype::Perfectionist => "perfectionist",
        }
    }
}

impl std::str::FromStr for Archetype {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "analyst" => Ok(Self::Analyst),
            "explorer" => Ok(Self::Explorer),
            "intuitive" => Ok(Self::Intuitive),
            "perfectionist" => Ok(Self::Perfectionist),
            other => Err(format!("unknown archetype: {}", other)),
        }
    }
}

impl std::fmt::Display for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub theme: String,
    pub difficulty: String,
    pub hints: bool,
    pub animations: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            difficulty: "normal".to_string(),
            hints: true,
            animations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub puzzle_type: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Durable per-user record. Owned by the client cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub archetype: Option<Archetype>,
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default)]
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            archetype: None,
            sessions: Vec::new(),
            preferences: Preferences::default(),
            created_at: Utc::now(),
        }
    }
}

/// Server health as seen by the client. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub user: f64,
    pub population: f64,
    /// Fraction of the population at or below the user's value.
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparativeInsights {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<Archetype>,
    pub sessions_completed: u64,
    pub population_size: u64,
    pub duration: MetricComparison,
    pub pace: MetricComparison,
    pub revision: MetricComparison,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<MetricComparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualNode {
    pub id: String,
    pub count: u64,
    /// Normalized activation in `[0, 1]`.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualEdge {
    pub from: String,
    pub to: String,
    pub count: u64,
    pub weight: f64,
}

/// Network of event types and observed transitions for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visualization {
    pub session_id: String,
    pub puzzle_type: String,
    pub nodes: Vec<VisualNode>,
    pub edges: Vec<VisualEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareReceipt {
    pub success: bool,
    pub share_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub user_id: String,
    pub archetype: Option<Archetype>,
    /// Similarity in `[0, 1]`.
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchList {
    pub matches: Vec<Match>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub user_id: String,
    pub puzzle_type: String,
    pub difficulty: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_wire_format_is_camel_case() {
        let session = Session {
            session_id: "s1".into(),
            user_id: "u1".into(),
            puzzle_type: "ego_labyrinth".into(),
            started_at: Utc::now(),
            resolution: Some("1920x1080".into()),
            user_agent: None,
            status: SessionStatus::Active,
            completed_at: None,
            final_state: None,
            metrics: None,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["puzzleType"], "ego_labyrinth");
        assert_eq!(json["status"], "active");
        assert!(json.get("userAgent").is_none());
    }

    #[test]
    fn test_profile_defaults_when_fields_missing() {
        let json = r#"{"userId":"u9","archetype":null,"createdAt":"2024-01-01T00:00:00Z"}"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.user_id, "u9");
        assert!(profile.archetype.is_none());
        assert!(profile.sessions.is_empty());
        assert_eq!(profile.preferences, Preferences::default());
    }

    #[test]
    fn test_archetype_parse() {
        assert_eq!("Explorer".parse::<Archetype>(), Ok(Archetype::Explorer));
        assert!("wizard".parse::<Archetype>().is_err());
        assert_eq!(Archetype::Perfectionist.to_string(), "perfectionist");
    }

    #[test]
    fn test_event_submission_defaults_timestamp() {
        let json = r#"{"sessionId":"s1","eventType":"click"}"#;
        let submission: EventSubmission = serde_json::from_str(json).unwrap();
        let before = Utc::now();
        let event = submission.into_event();
        assert_eq!(event.event_type, "click");
        assert!(event.payload.is_null());
        assert!(event.timestamp >= before);
    }
}
