//! Search documents and the FTS5 keyword channel.
//!
//! Every searchable node owns one `node_doc` row; its `doc_id` is the rowid of
//! the matching `fts_doc` entry. Documents are tokenized by
//! `porter unicode61 remove_diacritics 2`; queries are normalised here.

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::model::{NodeHit, NodeType, SearchFilters, Verification};
use super::storage_err;

/// Frozen English stop-word list applied to query text.
const STOP_WORDS: [&str; 48] = [
    "a", "about", "an", "and", "are", "as", "at", "be", "but", "by", "can", "did", "do", "does",
    "for", "from", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my",
    "not", "of", "on", "or", "our", "should", "so", "that", "the", "their", "then", "there",
    "this", "to", "was", "we", "what", "when", "where", "why",
];

const MIN_TOKEN_LEN: usize = 2;

/// BM25 column weights: title, body.
const TITLE_WEIGHT: f64 = 2.0;
const BODY_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDoc {
    pub node_id: String,
    pub workspace_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub summary: String,
    /// Searchable text other than the title.
    pub body: String,
    pub verification: Verification,
    pub updated_at: i64,
}

impl NodeDoc {
    /// Text handed to the embedder: title plus body.
    pub fn embed_text(&self) -> String {
        if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        }
    }
}

// ── Document maintenance ────────────────────────────────────────────────────

/// Insert or refresh a node's search document and its FTS row.
pub fn index_doc(conn: &Connection, doc: &NodeDoc) -> Result<()> {
    let doc_id: i64 = conn
        .query_row(
            "INSERT INTO node_doc
                 (node_id, workspace_id, node_type, title, summary, body, verification, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(node_id) DO UPDATE SET
                 workspace_id = excluded.workspace_id,
                 node_type    = excluded.node_type,
                 title        = excluded.title,
                 summary      = excluded.summary,
                 body         = excluded.body,
                 verification = excluded.verification,
                 updated_at   = excluded.updated_at
             RETURNING doc_id",
            params![
                doc.node_id,
                doc.workspace_id,
                doc.node_type.as_str(),
                doc.title,
                doc.summary,
                doc.body,
                doc.verification.as_str(),
                doc.updated_at,
            ],
            |row| row.get(0),
        )
        .map_err(storage_err)
        .with_context(|| format!("Failed to index node {}", doc.node_id))?;

    conn.execute("DELETE FROM fts_doc WHERE rowid = ?1", params![doc_id])
        .map_err(storage_err)?;
    conn.execute(
        "INSERT INTO fts_doc(rowid, title, body) VALUES (?1, ?2, ?3)",
        params![doc_id, doc.title, doc.body],
    )
    .map_err(storage_err)
    .context("Failed to write fts_doc row")?;
    Ok(())
}

/// Drop a node's document; edges and vectors cascade, the FTS row via trigger.
pub fn remove_doc(conn: &Connection, node_id: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM node_doc WHERE node_id = ?1", params![node_id])
        .map_err(storage_err)
        .with_context(|| format!("Failed to remove search document {node_id}"))?;
    Ok(n > 0)
}

pub fn get_doc(conn: &Connection, node_id: &str) -> Result<Option<NodeDoc>> {
    conn.query_row(
        "SELECT node_id, workspace_id, node_type, title, summary, body, verification, updated_at
         FROM node_doc WHERE node_id = ?1",
        params![node_id],
        row_to_doc,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load search document")
}

pub fn node_exists(conn: &Connection, node_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM node_doc WHERE node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(found.is_some())
}

/// Every document of a workspace, optionally narrowed to some types.
pub fn list_docs(
    conn: &Connection,
    workspace_id: &str,
    types: Option<&[NodeType]>,
) -> Result<Vec<NodeDoc>> {
    let mut stmt = conn
        .prepare(
            "SELECT node_id, workspace_id, node_type, title, summary, body, verification, updated_at
             FROM node_doc WHERE workspace_id = ?1 ORDER BY node_id",
        )
        .map_err(storage_err)?;
    let docs = stmt
        .query_map(params![workspace_id], row_to_doc)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(match types {
        Some(types) => docs
            .into_iter()
            .filter(|d| types.contains(&d.node_type))
            .collect(),
        None => docs,
    })
}

pub(crate) fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeDoc> {
    let node_type: String = row.get(2)?;
    let verification: String = row.get(6)?;
    Ok(NodeDoc {
        node_id: row.get(0)?,
        workspace_id: row.get(1)?,
        node_type: NodeType::parse(&node_type).unwrap_or(NodeType::Feature),
        title: row.get(3)?,
        summary: row.get(4)?,
        body: row.get(5)?,
        verification: Verification::parse(&verification).unwrap_or(Verification::Unchecked),
        updated_at: row.get(7)?,
    })
}

// ── Query side ──────────────────────────────────────────────────────────────

/// Lowercase, split on non-alphanumerics, drop stop-words and short tokens.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for raw in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
    {
        if STOP_WORDS.binary_search(&raw).is_ok() {
            continue;
        }
        let token = raw.to_string();
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}

/// FTS5 MATCH expression: each token quoted, OR-joined. `None` when empty.
pub fn build_match_query(query: &str) -> Option<String> {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// BM25-ranked keyword search. Scores are `-bm25`, so higher is better.
pub fn fts_search(
    conn: &Connection,
    query: &str,
    filters: &SearchFilters,
    limit: usize,
) -> Result<Vec<NodeHit>> {
    let Some(expr) = build_match_query(query) else {
        return Ok(Vec::new());
    };
    let (predicate, filter_params) = filters.sql_predicate(3);
    let sql = format!(
        "SELECT d.node_id,
                -bm25(fts_doc, {tw:.1}, {bw:.1}) AS score,
                snippet(fts_doc, 1, '[', ']', '…', 12)
         FROM fts_doc
         JOIN node_doc d ON d.doc_id = fts_doc.rowid
         WHERE fts_doc MATCH ?1 AND {predicate}
         ORDER BY score DESC, d.updated_at DESC, d.node_id ASC
         LIMIT ?2",
        tw = TITLE_WEIGHT,
        bw = BODY_WEIGHT,
    );
    let mut values: Vec<rusqlite::types::Value> = vec![
        rusqlite::types::Value::Text(expr),
        rusqlite::types::Value::Integer(limit as i64),
    ];
    values.extend(filter_params.into_iter().map(rusqlite::types::Value::Text));

    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let hits = stmt
        .query_map(params_from_iter(values), |row| {
            let snippet: Option<String> = row.get(2)?;
            Ok(NodeHit {
                node_id: row.get(0)?,
                score: row.get(1)?,
                snippet: snippet.filter(|s| !s.trim().is_empty()),
            })
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("FTS query failed")?;
    Ok(hits)
}

/// Short body excerpt for results that arrived without an FTS snippet.
pub fn fallback_snippet(doc: &NodeDoc, max_chars: usize) -> Option<String> {
    let text = if doc.summary.is_empty() {
        &doc.body
    } else {
        &doc.summary
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    Some(out)
}
