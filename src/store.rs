//! Server-side document store for sessions, events, and shared profiles.
//!
//! State lives in memory behind an async `RwLock`. When a data directory is
//! configured every mutation is also appended to `journal.jsonl`, one record
//! per line, and the journal is replayed on open:
//!
//! ```jsonl
//! {"kind":"session_started","session":{"sessionId":"9f..","userId":"u1",..}}
//! {"kind":"event_recorded","eventId":"1c..","event":{"sessionId":"9f..",..}}
//! {"kind":"session_completed","sessionId":"9f..","completedAt":"..",..}
//! ```
//!
//! Journal appends happen while the write lock is held, so journal order is
//! always state order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Event, Profile, Session, SessionMetrics, SessionStart, SessionStatus};

pub const JOURNAL_FILE: &str = "journal.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found")]
    SessionNotFound { session_id: String },
    #[error("session already completed")]
    AlreadyCompleted { session_id: String },
    #[error("session is completed")]
    SessionCompleted { session_id: String },
    #[error("profile not found")]
    ProfileNotFound { user_id: String },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One line of the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalRecord {
    SessionStarted {
        session: Session,
    },
    #[serde(rename_all = "camelCase")]
    EventRecorded {
        event_id: String,
        event: Event,
    },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: String,
        completed_at: DateTime<Utc>,
        final_state: serde_json::Value,
        metrics: SessionMetrics,
    },
    #[serde(rename_all = "camelCase")]
    ProfileShared {
        share_id: String,
        profile: Profile,
    },
}

/// Append-only JSONL journal.
struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open for appending after `replay`. Bytes past the last readable line
    /// are cut off so the next record starts on a fresh line.
    fn open(path: PathBuf, replay: &Replay) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        if len > replay.valid_len {
            warn!(
                journal = %path.display(),
                discarded_bytes = len - replay.valid_len,
                "truncating torn journal tail"
            );
            file.set_len(replay.valid_len)?;
        }
        if !replay.terminated {
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(Self { path, file })
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    fn load_all(path: &Path) -> Result<Replay, StoreError> {
        let mut replay = Replay {
            records: Vec::new(),
            valid_len: 0,
            terminated: true,
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let mut line_no = 0usize;
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            offset += read as u64;
            let terminated = buf.last() == Some(&b'\n');
            let text = String::from_utf8_lossy(&buf);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                if terminated {
                    replay.valid_len = offset;
                    replay.terminated = true;
                }
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(record) => {
                    replay.records.push(record);
                    replay.valid_len = offset;
                    replay.terminated = terminated;
                }
                // A torn final line from a crash mid-append is skipped.
                Err(e) => warn!(line = line_no, error = %e, "skipping unreadable journal line"),
            }
        }
        Ok(replay)
    }
}

/// Result of reading a journal: the records, the byte length up to the end
/// of the last readable line, and whether that line ended in a newline.
struct Replay {
    records: Vec<JournalRecord>,
    valid_len: u64,
    terminated: bool,
}

#[derive(Debug, Clone)]
struct SharedProfile {
    share_id: String,
    profile: Profile,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    events: HashMap<String, Vec<Event>>,
    shared: HashMap<String, SharedProfile>,
    journal: Option<Journal>,
}

impl StoreState {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::SessionStarted { session } => {
                self.events.entry(session.session_id.clone()).or_default();
                self.sessions.insert(session.session_id.clone(), session);
            }
            JournalRecord::EventRecorded { event, .. } => {
                self.events
                    .entry(event.session_id.clone())
                    .or_default()
                    .push(event);
            }
            JournalRecord::SessionCompleted {
                session_id,
                completed_at,
                final_state,
                metrics,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.status = SessionStatus::Completed;
                    session.completed_at = Some(completed_at);
                    session.final_state = Some(final_state);
                    session.metrics = Some(metrics);
                }
            }
            JournalRecord::ProfileShared { share_id, profile } => {
                self.shared
                    .insert(profile.user_id.clone(), SharedProfile { share_id, profile });
            }
        }
    }

    /// Journal first, then apply, so a failed write leaves state untouched.
    fn commit(&mut self, record: JournalRecord) -> Result<(), StoreError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&record)?;
        }
        self.apply(record);
        Ok(())
    }

    fn active_session(&self, session_id: &str) -> Result<&Session, StoreError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.is_completed() {
            return Err(StoreError::SessionCompleted {
                session_id: session_id.to_string(),
            });
        }
        Ok(session)
    }
}

/// Sessions, events, and shared profiles, optionally journaled to disk.
pub struct DocumentStore {
    state: RwLock<StoreState>,
}

impl DocumentStore {
    /// Memory-only store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Open a journaled store in `data_dir`, replaying any existing journal.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE);

        let mut state = StoreState::default();
        let mut replay = Journal::load_all(&path)?;
        let replayed = replay.records.len();
        for record in std::mem::take(&mut replay.records) {
            state.apply(record);
        }
        state.journal = Some(Journal::open(path.clone(), &replay)?);

        info!(
            journal = %path.display(),
            records = replayed,
            sessions = state.sessions.len(),
            "document store opened"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn start_session(&self, start: SessionStart) -> Result<Session, StoreError> {
        if start.user_id.trim().is_empty() {
            return Err(StoreError::Invalid("userId is required".into()));
        }
        if start.puzzle_type.trim().is_empty() {
            return Err(StoreError::Invalid("puzzleType is required".into()));
        }

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: start.user_id,
            puzzle_type: start.puzzle_type,
            started_at: Utc::now(),
            resolution: start.resolution,
            user_agent: start.user_agent,
            status: SessionStatus::Active,
            completed_at: None,
            final_state: None,
            metrics: None,
        };

        let mut state = self.state.write().await;
        state.commit(JournalRecord::SessionStarted {
            session: session.clone(),
        })?;
        debug!(session_id = %session.session_id, user_id = %session.user_id, "session started");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Record an event against an active session. Returns the event id.
    pub async fn record_event(&self, event: Event) -> Result<String, StoreError> {
        if event.event_type.trim().is_empty() {
            return Err(StoreError::Invalid("eventType is required".into()));
        }
        let mut state = self.state.write().await;
        state.active_session(&event.session_id)?;

        let event_id = Uuid::new_v4().to_string();
        state.commit(JournalRecord::EventRecorded {
            event_id: event_id.clone(),
            event,
        })?;
        Ok(event_id)
    }

    pub async fn events_for(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let state = self.state.read().await;
        if !state.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(state.events.get(session_id).cloned().unwrap_or_default())
    }

    /// Mark a session completed. A second completion is rejected.
    pub async fn complete_session(
        &self,
        session_id: &str,
        final_state: serde_json::Value,
        metrics: SessionMetrics,
    ) -> Result<Session, StoreError> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.is_completed() {
            return Err(StoreError::AlreadyCompleted {
                session_id: session_id.to_string(),
            });
        }

        state.commit(JournalRecord::SessionCompleted {
            session_id: session_id.to_string(),
            completed_at: Utc::now(),
            final_state,
            metrics,
        })?;
        info!(session_id = %session_id, "session completed");
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Every completed session, grouped by user id.
    pub async fn completed_by_user(&self) -> HashMap<String, Vec<Session>> {
        let state = self.state.read().await;
        let mut grouped: HashMap<String, Vec<Session>> = HashMap::new();
        for session in state.sessions.values().filter(|s| s.is_completed()) {
            grouped
                .entry(session.user_id.clone())
                .or_default()
                .push(session.clone());
        }
        for sessions in grouped.values_mut() {
            sessions.sort_by_key(|s| s.started_at);
        }
        grouped
    }

    /// Mirror a profile server-side. A user keeps one share id across re-shares.
    pub async fn share_profile(&self, profile: Profile) -> Result<String, StoreError> {
        if profile.user_id.trim().is_empty() {
            return Err(StoreError::Invalid("profile.userId is required".into()));
        }
        let mut state = self.state.write().await;
        let share_id = state
            .shared
            .get(&profile.user_id)
            .map(|s| s.share_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        state.commit(JournalRecord::ProfileShared {
            share_id: share_id.clone(),
            profile,
        })?;
        Ok(share_id)
    }

    pub async fn shared_profile(&self, user_id: &str) -> Result<Profile, StoreError> {
        let state = self.state.read().await;
        state
            .shared
            .get(user_id)
            .map(|s| s.profile.clone())
            .ok_or_else(|| StoreError::ProfileNotFound {
                user_id: user_id.to_string(),
            })
    }

    pub async fn shared_profiles(&self) -> Vec<Profile> {
        let state = self.state.read().await;
        state.shared.values().map(|s| s.profile.clone()).collect()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Shutdown hook: force the journal to stable storage.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let state = self.state.read().await;
        if let Some(journal) = state.journal.as_ref() {
            journal.file.sync_all()?;
            info!(journal = %journal.path.display(), "journal flushed");
        }
        Ok(())
    }
}
