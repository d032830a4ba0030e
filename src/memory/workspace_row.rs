use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::model::{Workspace, WorkspaceKind};
use super::{from_json, storage_err, to_json};

/// Insert or refresh the single row describing this repository.
pub fn upsert_workspace(conn: &Connection, ws: &Workspace, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO workspace(id, root_path, kind, services, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             root_path = excluded.root_path,
             kind = excluded.kind,
             services = excluded.services,
             updated_at = excluded.updated_at",
        params![ws.id, ws.root_path, ws.kind.as_str(), to_json(&ws.services)?, now],
    )
    .map_err(storage_err)
    .with_context(|| format!("Failed to store workspace {}", ws.id))?;
    Ok(())
}

pub fn get_workspace(conn: &Connection, id: &str) -> Result<Option<Workspace>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, root_path, kind, services FROM workspace WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(storage_err)
        .context("Failed to load workspace")?;
    let Some((id, root_path, kind, services)) = row else {
        return Ok(None);
    };
    Ok(Some(Workspace {
        id,
        root_path,
        kind: WorkspaceKind::parse(&kind)?,
        services: from_json(&services),
    }))
}
