//! Versioned migrations tracked in `PRAGMA user_version`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::error::MemoryError;

// ── Connection setup ────────────────────────────────────────────────────────

pub(crate) fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )
    .context("Failed to configure memory.db connection")?;
    Ok(())
}

// ── Migrations ──────────────────────────────────────────────────────────────

const V1_KNOWLEDGE_GRAPH: &str = "
CREATE TABLE workspace (
    id          TEXT    PRIMARY KEY,
    root_path   TEXT    NOT NULL,
    kind        TEXT    NOT NULL,
    services    TEXT    NOT NULL DEFAULT '[]',
    updated_at  INTEGER NOT NULL
);

CREATE TABLE node_doc (
    doc_id       INTEGER PRIMARY KEY,
    node_id      TEXT    NOT NULL UNIQUE,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    node_type    TEXT    NOT NULL,
    title        TEXT    NOT NULL,
    summary      TEXT    NOT NULL DEFAULT '',
    body         TEXT    NOT NULL DEFAULT '',
    verification TEXT    NOT NULL DEFAULT 'unchecked',
    updated_at   INTEGER NOT NULL
);
CREATE INDEX idx_node_doc_workspace ON node_doc(workspace_id, node_type);

CREATE VIRTUAL TABLE fts_doc USING fts5(
    title,
    body,
    tokenize = 'porter unicode61 remove_diacritics 2'
);

CREATE TRIGGER node_doc_fts_delete AFTER DELETE ON node_doc BEGIN
    DELETE FROM fts_doc WHERE rowid = old.doc_id;
END;

CREATE TABLE feature (
    id           TEXT    PRIMARY KEY,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    name         TEXT    NOT NULL,
    name_key     TEXT    NOT NULL,
    one_liner    TEXT    NOT NULL DEFAULT '',
    body         TEXT    NOT NULL DEFAULT '',
    tags         TEXT    NOT NULL DEFAULT '[]',
    status       TEXT    NOT NULL,
    metadata     TEXT    NOT NULL DEFAULT '{}',
    verification TEXT    NOT NULL DEFAULT 'unchecked',
    confidence   REAL    NOT NULL DEFAULT 1.0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    UNIQUE (workspace_id, name_key)
);

CREATE TABLE decision (
    id           TEXT    PRIMARY KEY,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    feature_id   TEXT    NOT NULL REFERENCES feature(id) ON DELETE CASCADE,
    title        TEXT    NOT NULL,
    title_key    TEXT    NOT NULL,
    summary      TEXT    NOT NULL DEFAULT '',
    reasoning    TEXT    NOT NULL DEFAULT '',
    tradeoffs    TEXT    NOT NULL DEFAULT '',
    evidence     TEXT    NOT NULL DEFAULT '[]',
    metadata     TEXT    NOT NULL DEFAULT '{}',
    verification TEXT    NOT NULL DEFAULT 'unchecked',
    confidence   REAL    NOT NULL DEFAULT 1.0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    UNIQUE (workspace_id, title_key)
);
CREATE INDEX idx_decision_feature ON decision(feature_id);

CREATE TABLE symbol (
    id           TEXT    PRIMARY KEY,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    name         TEXT    NOT NULL,
    kind         TEXT    NOT NULL,
    file_path    TEXT    NOT NULL,
    start_line   INTEGER NOT NULL,
    end_line     INTEGER NOT NULL,
    signature    TEXT    NOT NULL DEFAULT '',
    doc_comment  TEXT    NOT NULL DEFAULT '',
    module_path  TEXT    NOT NULL DEFAULT '',
    last_seen_at INTEGER NOT NULL
);
CREATE INDEX idx_symbol_name ON symbol(workspace_id, name);
CREATE INDEX idx_symbol_seen ON symbol(workspace_id, last_seen_at);

CREATE TABLE pattern (
    id           TEXT    PRIMARY KEY,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    title        TEXT    NOT NULL,
    title_key    TEXT    NOT NULL,
    body         TEXT    NOT NULL DEFAULT '',
    evidence     TEXT    NOT NULL DEFAULT '[]',
    metadata     TEXT    NOT NULL DEFAULT '{}',
    verification TEXT    NOT NULL DEFAULT 'unchecked',
    confidence   REAL    NOT NULL DEFAULT 1.0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    UNIQUE (workspace_id, title_key)
);

CREATE TABLE \"constraint\" (
    id           TEXT    PRIMARY KEY,
    workspace_id TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    title        TEXT    NOT NULL,
    title_key    TEXT    NOT NULL,
    body         TEXT    NOT NULL DEFAULT '',
    evidence     TEXT    NOT NULL DEFAULT '[]',
    metadata     TEXT    NOT NULL DEFAULT '{}',
    verification TEXT    NOT NULL DEFAULT 'unchecked',
    confidence   REAL    NOT NULL DEFAULT 1.0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    UNIQUE (workspace_id, title_key)
);

CREATE TABLE overview (
    workspace_id      TEXT    PRIMARY KEY REFERENCES workspace(id) ON DELETE CASCADE,
    short_description TEXT    NOT NULL DEFAULT '',
    long_description  TEXT    NOT NULL DEFAULT '',
    generated_at      INTEGER,
    last_edited_at    INTEGER
);

CREATE TABLE edge (
    from_id    TEXT    NOT NULL REFERENCES node_doc(node_id) ON DELETE CASCADE,
    to_id      TEXT    NOT NULL REFERENCES node_doc(node_id) ON DELETE CASCADE,
    kind       TEXT    NOT NULL,
    confidence REAL    NOT NULL DEFAULT 1.0,
    evidence   TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (from_id, to_id, kind)
);
CREATE INDEX idx_edge_to ON edge(to_id, kind);

CREATE TABLE embedding (
    node_id   TEXT    NOT NULL REFERENCES node_doc(node_id) ON DELETE CASCADE,
    model_tag TEXT    NOT NULL,
    dim       INTEGER NOT NULL,
    vec       BLOB    NOT NULL,
    PRIMARY KEY (node_id, model_tag)
);
CREATE INDEX idx_embedding_tag ON embedding(model_tag);
";

const V2_PLANS: &str = "
CREATE TABLE plan (
    id            TEXT    PRIMARY KEY,
    workspace_id  TEXT    NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
    goal          TEXT    NOT NULL,
    enriched_goal TEXT    NOT NULL DEFAULT '',
    status        TEXT    NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);
CREATE UNIQUE INDEX idx_plan_one_active ON plan(workspace_id) WHERE status = 'active';

CREATE TABLE task (
    id                  TEXT    PRIMARY KEY,
    plan_id             TEXT    NOT NULL REFERENCES plan(id) ON DELETE CASCADE,
    title               TEXT    NOT NULL,
    description         TEXT    NOT NULL DEFAULT '',
    acceptance_criteria TEXT    NOT NULL DEFAULT '[]',
    complexity          TEXT    NOT NULL DEFAULT 'medium',
    priority            INTEGER NOT NULL DEFAULT 0,
    status              TEXT    NOT NULL,
    parent_id           TEXT    REFERENCES task(id) ON DELETE SET NULL,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    completed_at        INTEGER
);
CREATE INDEX idx_task_plan ON task(plan_id, status);

CREATE TABLE task_dep (
    task_id    TEXT NOT NULL REFERENCES task(id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL REFERENCES task(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, depends_on)
);
CREATE INDEX idx_task_dep_target ON task_dep(depends_on);
";

/// Applied in order; index + 1 is the resulting `user_version`.
const MIGRATIONS: &[&str] = &[V1_KNOWLEDGE_GRAPH, V2_PLANS];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

pub(crate) fn user_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
        .context("Failed to read memory.db schema version")
}

/// Bring the schema up to `SCHEMA_VERSION`; refuse databases from the future.
pub(crate) fn migrate(conn: &mut Connection) -> Result<u32> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(MemoryError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        let version = idx as u32 + 1;
        let tx = conn
            .transaction()
            .context("Failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("Failed to apply memory.db migration v{version}"))?;
        tx.pragma_update(None, "user_version", version)
            .context("Failed to bump schema version")?;
        tx.commit()
            .with_context(|| format!("Failed to commit migration v{version}"))?;
        info!(version, "memory.db migration applied");
    }
    Ok(found)
}

/// Cheap integrity check run at open.
pub(crate) fn quick_check(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(crate::memory::storage_err)?;
    if verdict != "ok" {
        return Err(MemoryError::Storage {
            message: format!("integrity check failed: {verdict}"),
            hint: Some(
                "memory.db looks corrupted: restore it from a backup or delete it and run `taskwing bootstrap`"
                    .into(),
            ),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_fresh_db_to_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), 0);
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
        // second run is a no-op
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn upgrades_v1_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_KNOWLEDGE_GRAPH).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        migrate(&mut conn).unwrap();
        let plans: i64 = conn
            .query_row("SELECT COUNT(*) FROM plan", [], |r| r.get(0))
            .unwrap();
        assert_eq!(plans, 0);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 3)
            .unwrap();
        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(
            crate::error::domain_error(&err),
            Some(MemoryError::SchemaTooNew { .. })
        ));
    }

    #[test]
    fn fts_trigger_removes_documents() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO workspace(id, root_path, kind, updated_at) VALUES ('w', '/w', 'single', 0);
             INSERT INTO node_doc(doc_id, node_id, workspace_id, node_type, title, updated_at)
                 VALUES (7, 'n', 'w', 'feature', 'Auth', 0);
             INSERT INTO fts_doc(rowid, title, body) VALUES (7, 'Auth', 'tokens');
             DELETE FROM node_doc WHERE node_id = 'n';",
        )
        .unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM fts_doc", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
