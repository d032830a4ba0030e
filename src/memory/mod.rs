//! Repository-scoped knowledge store: one SQLite file per workspace memory dir.
//!
//! Entity operations are free functions over `&Connection` so they compose
//! inside a single write transaction; `Repo` owns the writer connection and
//! the cross-process lock.

pub mod edges;
pub mod features;
pub mod fts;
pub mod graph;
pub mod model;
pub mod notes;
pub mod schema;
pub mod symbols;
pub mod vectors;
pub mod workspace_row;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{self, MemoryError};
use crate::write_lock::FileLockGuard;
use model::{Node, NodeType, Overview};

pub const DB_FILE: &str = "memory.db";

// ── Error mapping ───────────────────────────────────────────────────────────

/// Lift disk-full / corruption into the domain taxonomy, keep the rest raw.
pub(crate) fn storage_err(err: rusqlite::Error) -> anyhow::Error {
    match error::from_sqlite(&err) {
        Some(domain) => anyhow::Error::new(domain).context(err.to_string()),
        None => anyhow::Error::new(err),
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// ── Repo ────────────────────────────────────────────────────────────────────

pub struct Repo {
    path: PathBuf,
    writer: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Repo {
    /// Open `memory.db` inside `dir`, creating the directory if needed.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        Self::open(&dir.join(DB_FILE))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create memory directory {}", parent.display())
            })?;
        }
        let mut conn = Connection::open(path)
            .map_err(storage_err)
            .with_context(|| format!("Failed to open memory.db at {}", path.display()))?;
        schema::configure_connection(&conn)?;
        schema::quick_check(&conn)?;
        {
            // migrations are writes: take the cross-process lock for them too
            let _lock = FileLockGuard::acquire(path)?;
            schema::migrate(&mut conn)?;
        }
        debug!(path = %path.display(), "memory.db opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            clock,
        })
    }

    /// Flush the WAL and release the writer connection.
    pub fn close(self) -> Result<()> {
        let conn = self
            .writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        conn.close()
            .map_err(|(_, e)| storage_err(e))
            .context("Failed to close memory.db")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Run `f` on a fresh read connection; readers never wait on the writer.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(storage_err)
        .with_context(|| format!("Failed to open reader on {}", self.path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000; PRAGMA query_only=ON;")
            .context("Failed to configure reader connection")?;
        f(&conn)
    }

    /// Exclusive writer: in-process mutex plus the advisory file lock.
    pub fn writer_lock(&self) -> Result<WriterGuard<'_>> {
        let conn = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file_lock = FileLockGuard::acquire(&self.path)?;
        Ok(WriterGuard {
            conn,
            _file_lock: file_lock,
        })
    }

    /// One IMMEDIATE transaction under the writer lock; rolled back on error.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.writer_lock()?;
        guard.transaction(f)
    }
}

pub struct WriterGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    _file_lock: FileLockGuard,
}

impl WriterGuard<'_> {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)
            .context("Failed to begin write transaction")?;
        let out = f(&tx)?;
        tx.commit()
            .map_err(storage_err)
            .context("Failed to commit write transaction")?;
        Ok(out)
    }
}

// ── Node lookup ─────────────────────────────────────────────────────────────

/// Load any node by id, dispatching on its search document's type.
pub fn get_node(conn: &Connection, node_id: &str) -> Result<Node> {
    let doc = fts::get_doc(conn, node_id)?.ok_or_else(|| MemoryError::not_found("node", node_id))?;
    let node = match doc.node_type {
        NodeType::Feature => Node::Feature(features::get_feature(conn, node_id)?),
        NodeType::Decision => Node::Decision(features::get_decision(conn, node_id)?),
        NodeType::Symbol => Node::Symbol(symbols::get_symbol(conn, node_id)?),
        NodeType::Pattern => Node::Pattern(notes::get_note(conn, model::NoteKind::Pattern, node_id)?),
        NodeType::Constraint => {
            Node::Constraint(notes::get_note(conn, model::NoteKind::Constraint, node_id)?)
        }
        NodeType::Overview => {
            let ws = node_id.trim_start_matches("overview:");
            Node::Overview(
                notes::get_overview(conn, ws)?
                    .ok_or_else(|| MemoryError::not_found("overview", ws))?,
            )
        }
    };
    Ok(node)
}

pub fn overview_node_id(workspace_id: &str) -> String {
    Overview::node_id_for(workspace_id)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── JSON column helpers ─────────────────────────────────────────────────────

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::clock::FixedClock;
    use crate::memory::model::{Workspace, WorkspaceKind};
    use tempfile::TempDir;

    pub const WS: &str = "ws0000000000000";

    /// Fresh repo with one single-kind workspace row.
    pub fn repo() -> (TempDir, Repo, Arc<FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at_millis(1_700_000_000_000));
        let repo = Repo::open_with_clock(&tmp.path().join(DB_FILE), clock.clone()).unwrap();
        repo.write(|tx| {
            workspace_row::upsert_workspace(
                tx,
                &Workspace {
                    id: WS.into(),
                    root_path: tmp.path().display().to_string(),
                    kind: WorkspaceKind::Single,
                    services: vec![],
                },
                0,
            )
        })
        .unwrap();
        (tmp, repo, clock)
    }
}
