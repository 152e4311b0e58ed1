//! Client-side key-value store and the profile cache built on it.
//!
//! Mirrors what the browser client keeps in `localStorage`: a user id, a
//! JSON profile, and the last session id, each under a well-known key.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Profile, SessionSummary};

pub const USER_ID_KEY: &str = "cognitive_user_id";
pub const PROFILE_KEY: &str = "cognitive_profile";
pub const LAST_SESSION_KEY: &str = "cognitive_last_session";

#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("local store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local store data is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("local store lock poisoned")]
    Poisoned,
}

/// String key-value storage scoped to one client install.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError>;
    fn remove(&self, key: &str) -> Result<(), LocalStoreError>;
    fn clear(&self) -> Result<(), LocalStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.clear();
        Ok(())
    }
}

/// JSON object on disk, rewritten in full on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(path: PathBuf) -> Result<Self, LocalStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), keys = entries.len(), "local store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), LocalStoreError> {
        let data = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.remove(key);
        self.persist(&entries)
    }

    fn clear(&self) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.clear();
        self.persist(&entries)
    }
}

/// Typed access to the user id, profile, and last session id.
pub struct ProfileCache {
    store: Box<dyn LocalStore>,
}

impl ProfileCache {
    pub fn new(store: Box<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    /// Stored user id, generating and persisting one on first use.
    pub fn user_id(&self) -> Result<String, LocalStoreError> {
        if let Some(id) = self.store.get(USER_ID_KEY)? {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let id = format!("user_{}", Uuid::new_v4().simple());
        self.store.set(USER_ID_KEY, &id)?;
        info!(user_id = %id, "generated user id");
        Ok(id)
    }

    /// The stored profile for `user_id`, or a freshly persisted default.
    ///
    /// A stored profile belonging to another user (the id was reset) is
    /// replaced. A corrupt stored profile is also replaced, with a warning.
    pub fn load_user_profile(&self, user_id: &str) -> Result<Profile, LocalStoreError> {
        if let Some(raw) = self.store.get(PROFILE_KEY)? {
            match serde_json::from_str::<Profile>(&raw) {
                Ok(profile) if profile.user_id == user_id => return Ok(profile),
                Ok(profile) => {
                    warn!(stored = %profile.user_id, user_id = %user_id, "stored profile belongs to another user")
                }
                Err(e) => warn!(error = %e, "discarding unreadable stored profile"),
            }
        }
        let profile = Profile::new(user_id);
        self.save_profile(&profile)?;
        info!(user_id = %user_id, "created default profile");
        Ok(profile)
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<(), LocalStoreError> {
        let raw = serde_json::to_string(profile)?;
        self.store.set(PROFILE_KEY, &raw)
    }

    /// Append a finished session to the stored profile.
    pub fn record_session(
        &self,
        user_id: &str,
        summary: SessionSummary,
    ) -> Result<Profile, LocalStoreError> {
        let mut profile = self.load_user_profile(user_id)?;
        profile.sessions.push(summary);
        self.save_profile(&profile)?;
        Ok(profile)
    }

    pub fn last_session(&self) -> Result<Option<String>, LocalStoreError> {
        Ok(self.store.get(LAST_SESSION_KEY)?.filter(|s| !s.is_empty()))
    }

    pub fn set_last_session(&self, session_id: &str) -> Result<(), LocalStoreError> {
        self.store.set(LAST_SESSION_KEY, session_id)
    }

    pub fn clear_last_session(&self) -> Result<(), LocalStoreError> {
        self.store.remove(LAST_SESSION_KEY)
    }

    /// Forget everything, as clearing browser storage would.
    pub fn reset(&self) -> Result<(), LocalStoreError> {
        self.store.clear()
    }
}
