//! Typed multi-graph edges. `(from, to, kind)` is the identity, so repeated
//! inserts are idempotent; `related` is stored once and read both ways.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use super::fts;
use super::model::{Direction, Edge, EdgeKind};
use super::storage_err;
use crate::error::MemoryError;

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<Edge> {
    let kind: String = row.get(2)?;
    Ok(Edge {
        from_id: row.get(0)?,
        to_id: row.get(1)?,
        kind: EdgeKind::parse(&kind).unwrap_or(EdgeKind::Related),
        confidence: row.get(3)?,
        evidence: row.get(4)?,
    })
}

/// Insert an edge after checking both endpoints exist. Re-inserting keeps the
/// higher confidence. Returns true when the edge is new.
pub fn add_edge(conn: &Connection, now: i64, edge: &Edge) -> Result<bool> {
    if edge.from_id == edge.to_id {
        return Err(MemoryError::validation(format!(
            "self-referencing {} edge on {}",
            edge.kind, edge.from_id
        ))
        .into());
    }
    if !(0.0..=1.0).contains(&edge.confidence) {
        return Err(MemoryError::validation("edge confidence outside [0, 1]").into());
    }
    for endpoint in [&edge.from_id, &edge.to_id] {
        if !fts::node_exists(conn, endpoint)? {
            return Err(MemoryError::not_found("node", endpoint.as_str()).into());
        }
    }
    let edge = edge.clone().normalized();
    let existed = edge_exists(conn, &edge.from_id, &edge.to_id, edge.kind)?;
    conn.execute(
        "INSERT INTO edge(from_id, to_id, kind, confidence, evidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(from_id, to_id, kind) DO UPDATE SET
             confidence = MAX(edge.confidence, excluded.confidence),
             evidence = COALESCE(excluded.evidence, edge.evidence)",
        params![
            edge.from_id,
            edge.to_id,
            edge.kind.as_str(),
            edge.confidence,
            edge.evidence,
            now
        ],
    )
    .map_err(storage_err)
    .context("Failed to insert edge")?;
    Ok(!existed)
}

pub fn edge_exists(conn: &Connection, from: &str, to: &str, kind: EdgeKind) -> Result<bool> {
    let key = Edge::new(from, to, kind).normalized();
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edge WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3",
            params![key.from_id, key.to_id, kind.as_str()],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    Ok(n > 0)
}

pub fn remove_edge(conn: &Connection, from: &str, to: &str, kind: EdgeKind) -> Result<bool> {
    let key = Edge::new(from, to, kind).normalized();
    let n = conn
        .execute(
            "DELETE FROM edge WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3",
            params![key.from_id, key.to_id, kind.as_str()],
        )
        .map_err(storage_err)
        .context("Failed to remove edge")?;
    Ok(n > 0)
}

/// Edges touching `node_id`. `related` edges match in any direction and are
/// returned oriented away from `node_id`.
pub fn get_edges(
    conn: &Connection,
    node_id: &str,
    direction: Direction,
    kinds: Option<&[EdgeKind]>,
) -> Result<Vec<Edge>> {
    let mut stmt = conn
        .prepare(
            "SELECT from_id, to_id, kind, confidence, evidence FROM edge
             WHERE from_id = ?1 OR to_id = ?1
             ORDER BY kind, from_id, to_id",
        )
        .map_err(storage_err)?;
    let all = stmt
        .query_map(params![node_id], row_to_edge)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Failed to read edges")?;

    let mut out = Vec::new();
    for mut edge in all {
        if kinds.is_some_and(|ks| !ks.contains(&edge.kind)) {
            continue;
        }
        if edge.kind.is_symmetric() {
            if edge.from_id != node_id {
                std::mem::swap(&mut edge.from_id, &mut edge.to_id);
            }
            out.push(edge);
            continue;
        }
        let keep = match direction {
            Direction::Out => edge.from_id == node_id,
            Direction::In => edge.to_id == node_id,
            Direction::Both => true,
        };
        if keep {
            out.push(edge);
        }
    }
    Ok(out)
}

/// All edges of a workspace, via their source documents.
pub fn list_workspace_edges(conn: &Connection, workspace_id: &str) -> Result<Vec<Edge>> {
    let mut stmt = conn
        .prepare(
            "SELECT e.from_id, e.to_id, e.kind, e.confidence, e.evidence FROM edge e
             JOIN node_doc d ON d.node_id = e.from_id
             WHERE d.workspace_id = ?1
             ORDER BY e.from_id, e.to_id, e.kind",
        )
        .map_err(storage_err)?;
    let edges = stmt
        .query_map(params![workspace_id], row_to_edge)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(edges)
}
