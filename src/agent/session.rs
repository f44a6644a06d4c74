//! Session persistence hook.
//!
//! The agent calls [`SessionStore::save`] after every turn. The shipped
//! [`JsonSessionStore`] writes one pretty-printed JSON file per session into
//! a directory, replacing it atomically (write to a temp file, then rename).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentError;
use crate::provider::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(system_prompt: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            system_prompt,
            messages: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Session>, AgentError>;
    async fn save(&self, session: &Session) -> Result<(), AgentError>;
    /// Stored session ids, most recently updated first.
    async fn list(&self) -> Result<Vec<String>, AgentError>;
}

#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn session_err(context: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::Session(format!("{context}: {e}"))
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, AgentError> {
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| session_err("failed to parse session", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(session_err("failed to read session", e)),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| session_err("failed to create session directory", e))?;
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| session_err("failed to serialize session", e))?;

        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| session_err("failed to write session", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| session_err("failed to write session", e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, AgentError> {
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(session_err("failed to list sessions", e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| session_err("failed to list sessions", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            found.push((modified, id.to_string()));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }
}
