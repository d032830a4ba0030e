//! Patterns, constraints and the per-workspace overview.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::fts::{self, NodeDoc};
use super::model::{canonical_title, EvidenceRef, Metadata, Note, NoteKind, NodeType, Overview, Verification};
use super::{from_json, is_unique_violation, new_id, storage_err, to_json};
use crate::error::MemoryError;

#[derive(Debug, Clone)]
pub struct NewNote {
    pub workspace_id: String,
    pub kind: NoteKind,
    pub title: String,
    pub body: String,
    pub evidence: Vec<EvidenceRef>,
    pub metadata: Metadata,
    pub verification: Verification,
    pub confidence: f64,
}

const NOTE_COLUMNS: &str = "id, workspace_id, title, body, evidence, metadata, verification,
     confidence, created_at, updated_at";

fn row_to_note(kind: NoteKind) -> impl Fn(&Row<'_>) -> rusqlite::Result<Note> {
    move |row| {
        let evidence: String = row.get(4)?;
        let metadata: String = row.get(5)?;
        let verification: String = row.get(6)?;
        Ok(Note {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            kind,
            title: row.get(2)?,
            body: row.get(3)?,
            evidence: from_json(&evidence),
            metadata: from_json(&metadata),
            verification: Verification::parse(&verification).unwrap_or(Verification::Unchecked),
            confidence: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

pub fn note_doc(n: &Note) -> NodeDoc {
    NodeDoc {
        node_id: n.id.clone(),
        workspace_id: n.workspace_id.clone(),
        node_type: n.kind.node_type(),
        title: n.title.clone(),
        summary: n.body.lines().next().unwrap_or_default().to_string(),
        body: n.body.clone(),
        verification: n.verification,
        updated_at: n.updated_at,
    }
}

pub fn create_note(conn: &Connection, now: i64, new: NewNote) -> Result<Note> {
    if new.title.trim().is_empty() {
        return Err(MemoryError::validation("note title must not be empty").into());
    }
    let note = Note {
        id: new_id(),
        workspace_id: new.workspace_id,
        kind: new.kind,
        title: new.title.trim().to_string(),
        body: new.body,
        evidence: new.evidence,
        metadata: new.metadata,
        verification: new.verification,
        confidence: new.confidence.clamp(0.0, 1.0),
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        &format!(
            "INSERT INTO {}({NOTE_COLUMNS}, title_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            note.kind.table()
        ),
        params![
            note.id,
            note.workspace_id,
            note.title,
            note.body,
            to_json(&note.evidence)?,
            to_json(&note.metadata)?,
            note.verification.as_str(),
            note.confidence,
            note.created_at,
            note.updated_at,
            canonical_title(&note.title),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            MemoryError::Conflict(format!("{} '{}' already exists", note.kind.node_type(), note.title)).into()
        } else {
            storage_err(e)
        }
    })?;
    fts::index_doc(conn, &note_doc(&note))?;
    Ok(note)
}

pub fn get_note(conn: &Connection, kind: NoteKind, id: &str) -> Result<Note> {
    conn.query_row(
        &format!("SELECT {NOTE_COLUMNS} FROM {} WHERE id = ?1", kind.table()),
        params![id],
        row_to_note(kind),
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load note")?
    .ok_or_else(|| MemoryError::not_found("note", id).into())
}

pub fn find_note(conn: &Connection, kind: NoteKind, workspace_id: &str, title: &str) -> Result<Option<Note>> {
    conn.query_row(
        &format!(
            "SELECT {NOTE_COLUMNS} FROM {} WHERE workspace_id = ?1 AND title_key = ?2",
            kind.table()
        ),
        params![workspace_id, canonical_title(title)],
        row_to_note(kind),
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to look up note")
}

pub fn list_notes(conn: &Connection, kind: NoteKind, workspace_id: &str) -> Result<Vec<Note>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM {} WHERE workspace_id = ?1 ORDER BY title_key",
            kind.table()
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![workspace_id], row_to_note(kind))
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(rows)
}

pub fn update_note(conn: &Connection, now: i64, note: &mut Note) -> Result<()> {
    note.updated_at = now;
    let changed = conn
        .execute(
            &format!(
                "UPDATE {} SET title = ?2, title_key = ?3, body = ?4, evidence = ?5, metadata = ?6,
                     verification = ?7, confidence = ?8, updated_at = ?9
                 WHERE id = ?1",
                note.kind.table()
            ),
            params![
                note.id,
                note.title,
                canonical_title(&note.title),
                note.body,
                to_json(&note.evidence)?,
                to_json(&note.metadata)?,
                note.verification.as_str(),
                note.confidence,
                note.updated_at,
            ],
        )
        .map_err(storage_err)?;
    if changed == 0 {
        return Err(MemoryError::not_found("note", &note.id).into());
    }
    fts::index_doc(conn, &note_doc(note))?;
    Ok(())
}

pub fn delete_note(conn: &Connection, kind: NoteKind, id: &str) -> Result<()> {
    get_note(conn, kind, id)?;
    fts::remove_doc(conn, id)?;
    conn.execute(&format!("DELETE FROM {} WHERE id = ?1", kind.table()), params![id])
        .map_err(storage_err)?;
    Ok(())
}

// ── Overview ────────────────────────────────────────────────────────────────

pub fn get_overview(conn: &Connection, workspace_id: &str) -> Result<Option<Overview>> {
    conn.query_row(
        "SELECT workspace_id, short_description, long_description, generated_at, last_edited_at
         FROM overview WHERE workspace_id = ?1",
        params![workspace_id],
        |row| {
            Ok(Overview {
                workspace_id: row.get(0)?,
                short_description: row.get(1)?,
                long_description: row.get(2)?,
                generated_at: row.get(3)?,
                last_edited_at: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load overview")
}

fn store_overview(conn: &Connection, o: &Overview, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO overview(workspace_id, short_description, long_description, generated_at, last_edited_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(workspace_id) DO UPDATE SET
             short_description = excluded.short_description,
             long_description = excluded.long_description,
             generated_at = excluded.generated_at,
             last_edited_at = excluded.last_edited_at",
        params![
            o.workspace_id,
            o.short_description,
            o.long_description,
            o.generated_at,
            o.last_edited_at
        ],
    )
    .map_err(storage_err)
    .context("Failed to store overview")?;
    fts::index_doc(
        conn,
        &NodeDoc {
            node_id: Overview::node_id_for(&o.workspace_id),
            workspace_id: o.workspace_id.clone(),
            node_type: NodeType::Overview,
            title: o.short_description.clone(),
            summary: o.short_description.clone(),
            body: o.long_description.clone(),
            verification: Verification::Unchecked,
            updated_at: now,
        },
    )
}

/// Store a generated overview unless a human has edited the current one.
/// Returns false when the manual edit was kept.
pub fn put_generated_overview(
    conn: &Connection,
    now: i64,
    workspace_id: &str,
    short: &str,
    long: &str,
) -> Result<bool> {
    if let Some(existing) = get_overview(conn, workspace_id)? {
        if existing.last_edited_at.is_some() {
            return Ok(false);
        }
    }
    store_overview(
        conn,
        &Overview {
            workspace_id: workspace_id.to_string(),
            short_description: short.to_string(),
            long_description: long.to_string(),
            generated_at: Some(now),
            last_edited_at: None,
        },
        now,
    )?;
    Ok(true)
}

/// Manual edit: stamps `last_edited_at`, keeps `generated_at`.
pub fn edit_overview(conn: &Connection, now: i64, workspace_id: &str, short: &str, long: &str) -> Result<Overview> {
    if short.trim().is_empty() {
        return Err(MemoryError::validation("overview short description must not be empty").into());
    }
    let generated_at = get_overview(conn, workspace_id)?.and_then(|o| o.generated_at);
    let overview = Overview {
        workspace_id: workspace_id.to_string(),
        short_description: short.to_string(),
        long_description: long.to_string(),
        generated_at,
        last_edited_at: Some(now),
    };
    store_overview(conn, &overview, now)?;
    Ok(overview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil::{repo, WS};

    fn new_note(kind: NoteKind, title: &str) -> NewNote {
        NewNote {
            workspace_id: WS.into(),
            kind,
            title: title.into(),
            body: "Tests live next to the code".into(),
            evidence: vec![],
            metadata: Metadata::new(),
            verification: Verification::Unchecked,
            confidence: 0.8,
        }
    }

    #[test]
    fn patterns_and_constraints_live_in_separate_tables() {
        let (_tmp, repo, _) = repo();
        repo.write(|tx| {
            create_note(tx, 1, new_note(NoteKind::Pattern, "Inline tests"))?;
            create_note(tx, 1, new_note(NoteKind::Constraint, "Inline tests"))?;
            Ok(())
        })
        .unwrap();
        let patterns = repo.read(|c| list_notes(c, NoteKind::Pattern, WS)).unwrap();
        let constraints = repo.read(|c| list_notes(c, NoteKind::Constraint, WS)).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(constraints.len(), 1);
        assert_ne!(patterns[0].id, constraints[0].id);
    }

    #[test]
    fn manual_overview_survives_regeneration() {
        let (_tmp, repo, _) = repo();
        assert!(repo
            .write(|tx| put_generated_overview(tx, 1, WS, "A CLI", "Generated text"))
            .unwrap());
        repo.write(|tx| edit_overview(tx, 2, WS, "Hand written", "Curated"))
            .unwrap();
        assert!(!repo
            .write(|tx| put_generated_overview(tx, 3, WS, "A CLI v2", "Regenerated"))
            .unwrap());
        let o = repo.read(|c| get_overview(c, WS)).unwrap().unwrap();
        assert_eq!(o.short_description, "Hand written");
        assert_eq!(o.generated_at, Some(1));
        assert_eq!(o.last_edited_at, Some(2));
    }
}
