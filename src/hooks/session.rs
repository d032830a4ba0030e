//! The hook session file: one JSON document under the memory dir, replaced
//! atomically on every change.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::write_core::{remove_if_exists, AtomicWriter};

pub const SESSION_FILE: &str = "hook_session.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub tasks_started: u32,
    #[serde(default)]
    pub tasks_completed: u32,
}

impl HookSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            plan_id: None,
            current_task_id: None,
            tasks_started: 0,
            tasks_completed: 0,
        }
    }

    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_minutes().max(0)
    }

    /// Hand `task_id` out as the current task. Counting is per distinct task.
    pub fn track(&mut self, task_id: &str) {
        if self.current_task_id.as_deref() != Some(task_id) {
            self.tasks_started += 1;
            self.current_task_id = Some(task_id.to_string());
        }
    }

    /// The tracked task finished and is no longer current. Never counts
    /// past what was started.
    pub fn complete_current(&mut self) {
        if self.current_task_id.take().is_some() && self.tasks_completed < self.tasks_started {
            self.tasks_completed += 1;
        }
    }

    pub fn short_id(&self) -> &str {
        self.session_id.get(..8).unwrap_or(&self.session_id)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(memory_dir: &Path) -> Self {
        Self {
            path: memory_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is no session. So is an unreadable one: the caller
    /// auto-initializes and the broken file gets replaced.
    pub fn load(&self) -> Result<Option<HookSession>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring unreadable hook session: {e}");
                Ok(None)
            }
        }
    }

    pub fn save(&self, session: &HookSession) -> Result<()> {
        AtomicWriter::default().write_json(&self.path, session)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}
