//! Features and the decisions that hang off them.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

use super::fts::{self, NodeDoc};
use super::model::{
    canonical_title, Decision, EvidenceRef, Feature, FeatureStatus, Metadata, NodeType,
    Verification,
};
use super::{from_json, is_unique_violation, new_id, storage_err, to_json};
use crate::error::MemoryError;

/// Feature that absorbs decisions with no better home.
pub const GENERAL_FEATURE: &str = "General";

#[derive(Debug, Clone)]
pub struct NewFeature {
    pub workspace_id: String,
    pub name: String,
    pub one_liner: String,
    pub body: String,
    pub tags: BTreeSet<String>,
    pub status: FeatureStatus,
    pub metadata: Metadata,
    pub verification: Verification,
    pub confidence: f64,
}

impl NewFeature {
    pub fn named(workspace_id: &str, name: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            one_liner: String::new(),
            body: String::new(),
            tags: BTreeSet::new(),
            status: FeatureStatus::Active,
            metadata: Metadata::new(),
            verification: Verification::Unchecked,
            confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub workspace_id: String,
    pub feature_id: String,
    pub title: String,
    pub summary: String,
    pub reasoning: String,
    pub tradeoffs: String,
    pub evidence: Vec<EvidenceRef>,
    pub metadata: Metadata,
    pub verification: Verification,
    pub confidence: f64,
}

impl NewDecision {
    pub fn titled(workspace_id: &str, feature_id: &str, title: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            feature_id: feature_id.to_string(),
            title: title.to_string(),
            summary: String::new(),
            reasoning: String::new(),
            tradeoffs: String::new(),
            evidence: Vec::new(),
            metadata: Metadata::new(),
            verification: Verification::Unchecked,
            confidence: 1.0,
        }
    }
}

fn require_title(what: &str, title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(MemoryError::validation(format!("{what} must not be empty")).into());
    }
    Ok(())
}

fn require_confidence(confidence: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(MemoryError::validation(format!(
            "confidence {confidence} outside [0, 1]"
        ))
        .into());
    }
    Ok(())
}

// ── Features ────────────────────────────────────────────────────────────────

const FEATURE_COLUMNS: &str = "f.id, f.workspace_id, f.name, f.one_liner, f.body, f.tags, f.status,
     f.metadata, f.verification, f.confidence, f.created_at, f.updated_at,
     (SELECT COUNT(*) FROM decision d WHERE d.feature_id = f.id)";

fn row_to_feature(row: &Row<'_>) -> rusqlite::Result<Feature> {
    let tags: String = row.get(5)?;
    let status: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    let verification: String = row.get(8)?;
    Ok(Feature {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        one_liner: row.get(3)?,
        body: row.get(4)?,
        tags: from_json(&tags),
        status: FeatureStatus::parse(&status).unwrap_or(FeatureStatus::Active),
        metadata: from_json(&metadata),
        verification: Verification::parse(&verification).unwrap_or(Verification::Unchecked),
        confidence: row.get(9)?,
        decision_count: row.get(12)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub fn feature_doc(f: &Feature) -> NodeDoc {
    let mut body = Vec::new();
    if !f.one_liner.is_empty() {
        body.push(f.one_liner.clone());
    }
    if !f.body.is_empty() {
        body.push(f.body.clone());
    }
    if !f.tags.is_empty() {
        body.push(f.tags.iter().cloned().collect::<Vec<_>>().join(" "));
    }
    NodeDoc {
        node_id: f.id.clone(),
        workspace_id: f.workspace_id.clone(),
        node_type: NodeType::Feature,
        title: f.name.clone(),
        summary: f.one_liner.clone(),
        body: body.join("\n"),
        verification: f.verification,
        updated_at: f.updated_at,
    }
}

pub fn create_feature(conn: &Connection, now: i64, new: NewFeature) -> Result<Feature> {
    require_title("feature name", &new.name)?;
    require_confidence(new.confidence)?;
    if let Some(existing) = find_feature(conn, &new.workspace_id, &new.name)? {
        return Err(MemoryError::Conflict(format!(
            "feature '{}' already exists (id {})",
            existing.name, existing.id
        ))
        .into());
    }
    let feature = Feature {
        id: new_id(),
        workspace_id: new.workspace_id,
        name: new.name.trim().to_string(),
        one_liner: new.one_liner,
        body: new.body,
        tags: new.tags,
        status: new.status,
        metadata: new.metadata,
        verification: new.verification,
        confidence: new.confidence,
        decision_count: 0,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO feature(id, workspace_id, name, name_key, one_liner, body, tags, status,
                             metadata, verification, confidence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            feature.id,
            feature.workspace_id,
            feature.name,
            canonical_title(&feature.name),
            feature.one_liner,
            feature.body,
            to_json(&feature.tags)?,
            feature.status.as_str(),
            to_json(&feature.metadata)?,
            feature.verification.as_str(),
            feature.confidence,
            feature.created_at,
            feature.updated_at,
        ],
    )
    .map_err(|e| conflict_or_storage(e, "feature", &feature.name))?;
    fts::index_doc(conn, &feature_doc(&feature))?;
    Ok(feature)
}

fn conflict_or_storage(err: rusqlite::Error, what: &str, name: &str) -> anyhow::Error {
    if is_unique_violation(&err) {
        MemoryError::Conflict(format!("{what} '{name}' already exists")).into()
    } else {
        storage_err(err)
    }
}

pub fn get_feature(conn: &Connection, id: &str) -> Result<Feature> {
    conn.query_row(
        &format!("SELECT {FEATURE_COLUMNS} FROM feature f WHERE f.id = ?1"),
        params![id],
        row_to_feature,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load feature")?
    .ok_or_else(|| MemoryError::not_found("feature", id).into())
}

/// Case-insensitive lookup by name.
pub fn find_feature(conn: &Connection, workspace_id: &str, name: &str) -> Result<Option<Feature>> {
    conn.query_row(
        &format!(
            "SELECT {FEATURE_COLUMNS} FROM feature f WHERE f.workspace_id = ?1 AND f.name_key = ?2"
        ),
        params![workspace_id, canonical_title(name)],
        row_to_feature,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to look up feature by name")
}

pub fn list_features(conn: &Connection, workspace_id: &str) -> Result<Vec<Feature>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {FEATURE_COLUMNS} FROM feature f WHERE f.workspace_id = ?1 ORDER BY f.name_key"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![workspace_id], row_to_feature)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Failed to list features")?;
    Ok(rows)
}

/// Persist every mutable field; stamps `updated_at`.
pub fn update_feature(conn: &Connection, now: i64, feature: &mut Feature) -> Result<()> {
    require_title("feature name", &feature.name)?;
    require_confidence(feature.confidence)?;
    feature.updated_at = now;
    let changed = conn
        .execute(
            "UPDATE feature SET name = ?2, name_key = ?3, one_liner = ?4, body = ?5, tags = ?6,
                 status = ?7, metadata = ?8, verification = ?9, confidence = ?10, updated_at = ?11
             WHERE id = ?1",
            params![
                feature.id,
                feature.name,
                canonical_title(&feature.name),
                feature.one_liner,
                feature.body,
                to_json(&feature.tags)?,
                feature.status.as_str(),
                to_json(&feature.metadata)?,
                feature.verification.as_str(),
                feature.confidence,
                feature.updated_at,
            ],
        )
        .map_err(|e| conflict_or_storage(e, "feature", &feature.name))?;
    if changed == 0 {
        return Err(MemoryError::not_found("feature", &feature.id).into());
    }
    fts::index_doc(conn, &feature_doc(feature))?;
    Ok(())
}

/// Refuses while other nodes `depends_on` this feature unless `force`.
/// Decisions, their edges and vectors go with it.
pub fn delete_feature(conn: &Connection, id: &str, force: bool) -> Result<()> {
    let feature = get_feature(conn, id)?;
    let dependents: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edge WHERE to_id = ?1 AND kind = 'depends_on'",
            params![id],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    if dependents > 0 && !force {
        return Err(MemoryError::Conflict(format!(
            "feature '{}' has {dependents} dependent(s); delete with force to remove it anyway",
            feature.name
        ))
        .into());
    }
    for decision in list_decisions(conn, id)? {
        fts::remove_doc(conn, &decision.id)?;
    }
    fts::remove_doc(conn, id)?;
    conn.execute("DELETE FROM feature WHERE id = ?1", params![id])
        .map_err(storage_err)
        .context("Failed to delete feature")?;
    Ok(())
}

/// The per-workspace catch-all feature, created on demand.
pub fn ensure_general_feature(conn: &Connection, now: i64, workspace_id: &str) -> Result<Feature> {
    if let Some(existing) = find_feature(conn, workspace_id, GENERAL_FEATURE)? {
        return Ok(existing);
    }
    let mut new = NewFeature::named(workspace_id, GENERAL_FEATURE);
    new.one_liner = "Project-wide decisions not tied to a single feature".into();
    create_feature(conn, now, new)
}

// ── Decisions ───────────────────────────────────────────────────────────────

const DECISION_COLUMNS: &str = "id, workspace_id, feature_id, title, summary, reasoning, tradeoffs,
     evidence, metadata, verification, confidence, created_at, updated_at";

fn row_to_decision(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let evidence: String = row.get(7)?;
    let metadata: String = row.get(8)?;
    let verification: String = row.get(9)?;
    Ok(Decision {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        feature_id: row.get(2)?,
        title: row.get(3)?,
        summary: row.get(4)?,
        reasoning: row.get(5)?,
        tradeoffs: row.get(6)?,
        evidence: from_json(&evidence),
        metadata: from_json(&metadata),
        verification: Verification::parse(&verification).unwrap_or(Verification::Unchecked),
        confidence: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub fn decision_doc(d: &Decision) -> NodeDoc {
    let body = [d.summary.as_str(), d.reasoning.as_str(), d.tradeoffs.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    let summary = if d.summary.is_empty() {
        d.reasoning.clone()
    } else {
        d.summary.clone()
    };
    NodeDoc {
        node_id: d.id.clone(),
        workspace_id: d.workspace_id.clone(),
        node_type: NodeType::Decision,
        title: d.title.clone(),
        summary,
        body,
        verification: d.verification,
        updated_at: d.updated_at,
    }
}

pub fn create_decision(conn: &Connection, now: i64, new: NewDecision) -> Result<Decision> {
    require_title("decision title", &new.title)?;
    require_confidence(new.confidence)?;
    // the owning feature must exist in the same workspace
    let owner = get_feature(conn, &new.feature_id)?;
    if owner.workspace_id != new.workspace_id {
        return Err(MemoryError::validation("decision and feature belong to different workspaces").into());
    }
    let decision = Decision {
        id: new_id(),
        workspace_id: new.workspace_id,
        feature_id: new.feature_id,
        title: new.title.trim().to_string(),
        summary: new.summary,
        reasoning: new.reasoning,
        tradeoffs: new.tradeoffs,
        evidence: new.evidence,
        metadata: new.metadata,
        verification: new.verification,
        confidence: new.confidence,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        &format!(
            "INSERT INTO decision({DECISION_COLUMNS}, title_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            decision.id,
            decision.workspace_id,
            decision.feature_id,
            decision.title,
            decision.summary,
            decision.reasoning,
            decision.tradeoffs,
            to_json(&decision.evidence)?,
            to_json(&decision.metadata)?,
            decision.verification.as_str(),
            decision.confidence,
            decision.created_at,
            decision.updated_at,
            canonical_title(&decision.title),
        ],
    )
    .map_err(|e| conflict_or_storage(e, "decision", &decision.title))?;
    fts::index_doc(conn, &decision_doc(&decision))?;
    Ok(decision)
}

pub fn get_decision(conn: &Connection, id: &str) -> Result<Decision> {
    conn.query_row(
        &format!("SELECT {DECISION_COLUMNS} FROM decision WHERE id = ?1"),
        params![id],
        row_to_decision,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load decision")?
    .ok_or_else(|| MemoryError::not_found("decision", id).into())
}

pub fn find_decision(conn: &Connection, workspace_id: &str, title: &str) -> Result<Option<Decision>> {
    conn.query_row(
        &format!("SELECT {DECISION_COLUMNS} FROM decision WHERE workspace_id = ?1 AND title_key = ?2"),
        params![workspace_id, canonical_title(title)],
        row_to_decision,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to look up decision by title")
}

pub fn list_decisions(conn: &Connection, feature_id: &str) -> Result<Vec<Decision>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DECISION_COLUMNS} FROM decision WHERE feature_id = ?1 ORDER BY created_at, id"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![feature_id], row_to_decision)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Failed to list decisions")?;
    Ok(rows)
}

pub fn update_decision(conn: &Connection, now: i64, decision: &mut Decision) -> Result<()> {
    require_title("decision title", &decision.title)?;
    require_confidence(decision.confidence)?;
    decision.updated_at = now;
    let changed = conn
        .execute(
            "UPDATE decision SET feature_id = ?2, title = ?3, title_key = ?4, summary = ?5,
                 reasoning = ?6, tradeoffs = ?7, evidence = ?8, metadata = ?9,
                 verification = ?10, confidence = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                decision.id,
                decision.feature_id,
                decision.title,
                canonical_title(&decision.title),
                decision.summary,
                decision.reasoning,
                decision.tradeoffs,
                to_json(&decision.evidence)?,
                to_json(&decision.metadata)?,
                decision.verification.as_str(),
                decision.confidence,
                decision.updated_at,
            ],
        )
        .map_err(|e| conflict_or_storage(e, "decision", &decision.title))?;
    if changed == 0 {
        return Err(MemoryError::not_found("decision", &decision.id).into());
    }
    fts::index_doc(conn, &decision_doc(decision))?;
    Ok(())
}

pub fn delete_decision(conn: &Connection, id: &str) -> Result<()> {
    get_decision(conn, id)?;
    fts::remove_doc(conn, id)?;
    conn.execute("DELETE FROM decision WHERE id = ?1", params![id])
        .map_err(storage_err)
        .context("Failed to delete decision")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use crate::memory::edges::add_edge;
    use crate::memory::model::{Edge, EdgeKind};
    use crate::memory::testutil::{repo, WS};

    #[test]
    fn names_are_unique_case_insensitively() {
        let (_tmp, repo, _) = repo();
        repo.write(|tx| create_feature(tx, 1, NewFeature::named(WS, "Auth")))
            .unwrap();
        let err = repo
            .write(|tx| create_feature(tx, 2, NewFeature::named(WS, "  AUTH ")))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Conflict);
    }

    #[test]
    fn round_trip_and_decision_count() {
        let (_tmp, repo, _) = repo();
        let created = repo
            .write(|tx| {
                let mut new = NewFeature::named(WS, "Auth");
                new.one_liner = "JWT auth".into();
                new.tags.insert("security".into());
                let f = create_feature(tx, 10, new)?;
                let mut d = NewDecision::titled(WS, &f.id, "Use JWT");
                d.reasoning = "stateless".into();
                create_decision(tx, 11, d)?;
                Ok(f)
            })
            .unwrap();
        let loaded = repo.read(|c| get_feature(c, &created.id)).unwrap();
        assert_eq!(loaded.decision_count, 1);
        assert_eq!(Feature { decision_count: 0, ..loaded }, created);
    }

    #[test]
    fn empty_name_is_rejected() {
        let (_tmp, repo, _) = repo();
        let err = repo
            .write(|tx| create_feature(tx, 1, NewFeature::named(WS, "   ")))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Validation);
    }

    #[test]
    fn dependents_block_delete_unless_forced() {
        let (_tmp, repo, _) = repo();
        let (core, api) = repo
            .write(|tx| {
                let core = create_feature(tx, 1, NewFeature::named(WS, "Core"))?;
                let api = create_feature(tx, 1, NewFeature::named(WS, "Api"))?;
                add_edge(tx, 1, &Edge::new(&api.id, &core.id, EdgeKind::DependsOn))?;
                Ok((core, api))
            })
            .unwrap();

        let err = repo.write(|tx| delete_feature(tx, &core.id, false)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Conflict);

        repo.write(|tx| delete_feature(tx, &core.id, true)).unwrap();
        let dangling: i64 = repo
            .read(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM edge WHERE from_id = ?1 OR to_id = ?1",
                    params![api.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(dangling, 0);
    }

    #[test]
    fn deleting_feature_cascades_decisions() {
        let (_tmp, repo, _) = repo();
        let (f, d) = repo
            .write(|tx| {
                let f = create_feature(tx, 1, NewFeature::named(WS, "Billing"))?;
                let d = create_decision(tx, 1, NewDecision::titled(WS, &f.id, "Use Stripe"))?;
                Ok((f, d))
            })
            .unwrap();
        repo.write(|tx| delete_feature(tx, &f.id, false)).unwrap();
        let err = repo.read(|c| get_decision(c, &d.id)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::NotFound);
        assert!(repo.read(|c| fts::get_doc(c, &d.id)).unwrap().is_none());
    }

    #[test]
    fn general_feature_is_created_once() {
        let (_tmp, repo, _) = repo();
        let a = repo.write(|tx| ensure_general_feature(tx, 1, WS)).unwrap();
        let b = repo.write(|tx| ensure_general_feature(tx, 2, WS)).unwrap();
        assert_eq!(a.id, b.id);
    }
}
