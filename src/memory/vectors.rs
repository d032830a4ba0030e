//! Stored embeddings and the exact cosine k-NN channel.
//!
//! Vectors are L2-normalised before they are written, so cosine similarity is
//! a plain dot product. Blobs are little-endian `f32`.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::cmp::Ordering;

use super::fts::{self, NodeDoc};
use super::model::{NodeHit, SearchFilters};
use super::storage_err;
use crate::error::MemoryError;

/// Above this many candidate rows the scan fans out over rayon.
const PARALLEL_SCAN_ROWS: usize = 4096;

pub fn encode(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Scale to unit length; a zero vector stays zero.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Store (or replace) the vector for a node under `model_tag`.
pub fn put_vector(conn: &Connection, node_id: &str, model_tag: &str, vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(MemoryError::validation("empty embedding vector").into());
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::validation("embedding contains non-finite values").into());
    }
    let mut unit = vector.to_vec();
    l2_normalize(&mut unit);
    conn.execute(
        "INSERT INTO embedding(node_id, model_tag, dim, vec) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(node_id, model_tag) DO UPDATE SET dim = excluded.dim, vec = excluded.vec",
        params![node_id, model_tag, unit.len() as i64, encode(&unit)],
    )
    .map_err(storage_err)
    .with_context(|| format!("Failed to store embedding for {node_id}"))?;
    Ok(())
}

pub fn get_vector(conn: &Connection, node_id: &str, model_tag: &str) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT vec FROM embedding WHERE node_id = ?1 AND model_tag = ?2",
            params![node_id, model_tag],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(blob.map(|b| decode(&b)))
}

pub fn delete_vectors(conn: &Connection, node_id: &str) -> Result<usize> {
    conn.execute("DELETE FROM embedding WHERE node_id = ?1", params![node_id])
        .map_err(storage_err)
        .context("Failed to delete embeddings")
}

pub fn count_vectors(conn: &Connection, workspace_id: &str, model_tag: &str) -> Result<usize> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM embedding e JOIN node_doc d ON d.node_id = e.node_id
             WHERE d.workspace_id = ?1 AND e.model_tag = ?2",
            params![workspace_id, model_tag],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    Ok(n as usize)
}

/// Documents with no vector for `model_tag` (embedding backlog).
pub fn docs_missing_vectors(
    conn: &Connection,
    workspace_id: &str,
    model_tag: &str,
) -> Result<Vec<NodeDoc>> {
    let mut stmt = conn
        .prepare(
            "SELECT d.node_id, d.workspace_id, d.node_type, d.title, d.summary, d.body,
                    d.verification, d.updated_at
             FROM node_doc d
             WHERE d.workspace_id = ?1
               AND NOT EXISTS (SELECT 1 FROM embedding e
                               WHERE e.node_id = d.node_id AND e.model_tag = ?2)
             ORDER BY d.node_id",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![workspace_id, model_tag], fts::row_to_doc)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(rows)
}

/// Exact top-k by cosine similarity. Rows of a different dimension are
/// skipped. Ties fall back to node id ascending.
pub fn vector_knn(
    conn: &Connection,
    query: &[f32],
    k: usize,
    model_tag: &str,
    filters: &SearchFilters,
) -> Result<Vec<NodeHit>> {
    if k == 0 || query.is_empty() {
        return Ok(Vec::new());
    }
    let mut q = query.to_vec();
    l2_normalize(&mut q);

    let (predicate, filter_params) = filters.sql_predicate(2);
    let sql = format!(
        "SELECT e.node_id, e.vec FROM embedding e
         JOIN node_doc d ON d.node_id = e.node_id
         WHERE e.model_tag = ?1 AND {predicate}"
    );
    let mut values = vec![model_tag.to_string()];
    values.extend(filter_params);

    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let rows: Vec<(String, Vec<u8>)> = stmt
        .query_map(params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Vector scan failed")?;

    let dim_bytes = q.len() * 4;
    let score = |(id, blob): &(String, Vec<u8>)| -> Option<(String, f32)> {
        (blob.len() == dim_bytes).then(|| (id.clone(), dot(&q, &decode(blob))))
    };
    let mut scored: Vec<(String, f32)> = if rows.len() > PARALLEL_SCAN_ROWS {
        rows.par_iter().filter_map(score).collect()
    } else {
        rows.iter().filter_map(score).collect()
    };

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    Ok(scored
        .into_iter()
        .map(|(node_id, sim)| NodeHit {
            node_id,
            score: f64::from(sim.clamp(-1.0, 1.0)),
            snippet: None,
        })
        .collect())
}
