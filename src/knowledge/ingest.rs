//! Findings → nodes. Group, merge with what is stored, verify evidence,
//! resolve relationships by title, embed what changed. One transaction.

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use super::evidence;
use crate::cancel::CancelToken;
use crate::error::{domain_error, is_cancelled, MemoryError};
use crate::memory::features::{self, NewDecision, NewFeature};
use crate::memory::model::{
    canonical_title, Edge, EvidenceRef, Finding, FindingRelation, FindingType, FeatureStatus,
    Metadata, NoteKind, Symbol, SymbolKind, Verification,
};
use crate::memory::fts::{self, NodeDoc};
use crate::memory::notes::{self, NewNote};
use crate::memory::{edges, graph, symbols, vectors, Repo};
use crate::providers::{EmbedRole, Embedder, FileSource, Providers};

const EMBED_BATCH: usize = 64;

/// Metadata keys consumed for symbol structure; not stored as metadata.
const SYMBOL_KEYS: &[&str] = &[
    "kind",
    "file_path",
    "start_line",
    "end_line",
    "signature",
    "doc_comment",
    "module_path",
];

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub verify_evidence: bool,
    pub cancel: CancelToken,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            verify_evidence: true,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub findings: usize,
    pub nodes_created: usize,
    pub nodes_merged: usize,
    pub nodes_unchanged: usize,
    pub edges_created: usize,
    pub edges_existing: usize,
    pub relationships_dropped: usize,
    pub evidence_dropped: usize,
    pub unverified: usize,
    pub embedded: usize,
    pub embeddings_degraded: bool,
    pub warnings: Vec<String>,
    /// Title of every ingested node → its id.
    pub ids: BTreeMap<String, String>,
}

impl IngestReport {
    fn warn(&mut self, msg: String) {
        warn!("{msg}");
        self.warnings.push(msg);
    }
}

// ── Grouping ────────────────────────────────────────────────────────────────

/// Findings sharing `(type, canonical title)`, folded into one.
#[derive(Debug, Clone)]
struct Group {
    kind: FindingType,
    key: String,
    title: String,
    body: String,
    evidence: Vec<EvidenceRef>,
    metadata: Metadata,
    tags: BTreeSet<String>,
    confidence: f64,
    verification: Verification,
}

impl Group {
    fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn symbol_file(&self) -> Option<&str> {
        self.meta("file_path")
            .or_else(|| self.evidence.first().map(|e| e.file_path.as_str()))
    }

    fn stored_metadata(&self) -> Metadata {
        let mut out = self.metadata.clone();
        if self.kind == FindingType::Symbol {
            out.retain(|k, _| !SYMBOL_KEYS.contains(&k.as_str()));
        }
        out
    }
}

fn parse_tags(raw: Option<&String>) -> BTreeSet<String> {
    raw.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Append `extra` as a new paragraph unless already present.
fn merge_text(into: &mut String, extra: &str) -> bool {
    let extra = extra.trim();
    if extra.is_empty() || into.contains(extra) {
        return false;
    }
    if !into.is_empty() {
        into.push_str("\n\n");
    }
    into.push_str(extra);
    true
}

fn union_evidence(into: &mut Vec<EvidenceRef>, extra: &[EvidenceRef]) {
    let mut seen: BTreeSet<EvidenceRef> = into.iter().cloned().collect();
    for ev in extra {
        if seen.insert(ev.clone()) {
            into.push(ev.clone());
        }
    }
}

fn group_findings(findings: &[Finding]) -> Vec<Group> {
    let mut groups: BTreeMap<(u8, String), Group> = BTreeMap::new();
    for f in findings {
        let key = canonical_title(&f.title);
        if key.is_empty() {
            continue;
        }
        let rank = type_rank(f.finding_type);
        // same-named symbols in different files stay distinct
        let slot = match f.finding_type {
            FindingType::Symbol => format!(
                "{key}\u{0}{}",
                f.meta("file_path")
                    .or_else(|| f.evidence.first().map(|e| e.file_path.as_str()))
                    .unwrap_or_default()
            ),
            _ => key.clone(),
        };
        let g = groups.entry((rank, slot)).or_insert_with(|| Group {
            kind: f.finding_type,
            key,
            title: f.title.split_whitespace().collect::<Vec<_>>().join(" "),
            body: String::new(),
            evidence: Vec::new(),
            metadata: Metadata::new(),
            tags: BTreeSet::new(),
            confidence: 0.0,
            verification: Verification::Unchecked,
        });
        merge_text(&mut g.body, &f.body);
        union_evidence(&mut g.evidence, &f.evidence);
        g.tags.extend(parse_tags(f.metadata.get("tags")));
        for (k, v) in &f.metadata {
            if !v.trim().is_empty() {
                g.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        g.confidence = g.confidence.max(f.confidence.clamp(0.0, 1.0));
    }
    groups.into_values().collect()
}

/// Resolution priority when titles collide across types.
fn type_rank(t: FindingType) -> u8 {
    match t {
        FindingType::Feature => 0,
        FindingType::Decision => 1,
        FindingType::Pattern => 2,
        FindingType::Constraint => 3,
        FindingType::Symbol => 4,
    }
}

fn verify_groups(files: &dyn FileSource, groups: &mut [Group], report: &mut IngestReport) -> Result<()> {
    for g in groups.iter_mut() {
        let out = evidence::verify(files, &g.evidence, g.confidence)?;
        if out.dropped > 0 {
            report.warn(format!(
                "'{}': dropped {} evidence ref(s) to missing files",
                g.title, out.dropped
            ));
        }
        report.evidence_dropped += out.dropped;
        if out.verification == Verification::Unverified {
            report.unverified += 1;
        }
        g.evidence = out.kept;
        g.verification = out.verification;
        g.confidence = out.confidence;
    }
    Ok(())
}

/// Checked evidence overrides the stored verdict; unchecked keeps the best.
fn apply_verdict(verification: &mut Verification, confidence: &mut f64, g: &Group) {
    if g.verification == Verification::Unchecked {
        *confidence = confidence.max(g.confidence);
    } else {
        *verification = g.verification;
        *confidence = g.confidence;
    }
}

fn absorb_metadata(into: &mut Metadata, g: &Group) {
    for (k, v) in g.stored_metadata() {
        into.entry(k).or_insert(v);
    }
}

// ── Upserts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Merged,
    Unchanged,
}

struct Touched {
    id: String,
    outcome: Outcome,
}

fn parse_status(g: &Group, report: &mut IngestReport) -> Option<FeatureStatus> {
    let raw = g.meta("status")?;
    match FeatureStatus::parse(&raw.to_lowercase()) {
        Ok(s) => Some(s),
        Err(_) => {
            report.warn(format!("'{}': unknown status '{raw}', ignored", g.title));
            None
        }
    }
}

fn upsert_feature(conn: &Connection, now: i64, ws: &str, g: &Group, report: &mut IngestReport) -> Result<Touched> {
    let status = parse_status(g, report);
    if let Some(mut f) = features::find_feature(conn, ws, &g.title)? {
        let before = f.clone();
        merge_text(&mut f.body, &g.body);
        if f.one_liner.is_empty() {
            f.one_liner = g.meta("one_liner").unwrap_or_default().to_string();
        }
        f.tags.extend(g.tags.iter().cloned());
        if let Some(s) = status {
            f.status = s;
        }
        absorb_metadata(&mut f.metadata, g);
        apply_verdict(&mut f.verification, &mut f.confidence, g);
        if f == before {
            return Ok(Touched { id: f.id, outcome: Outcome::Unchanged });
        }
        features::update_feature(conn, now, &mut f)?;
        return Ok(Touched { id: f.id, outcome: Outcome::Merged });
    }
    let mut new = NewFeature::named(ws, &g.title);
    new.one_liner = g.meta("one_liner").unwrap_or_default().to_string();
    new.body = g.body.clone();
    new.tags = g.tags.clone();
    new.status = status.unwrap_or(FeatureStatus::Active);
    new.metadata = g.stored_metadata();
    new.verification = g.verification;
    new.confidence = g.confidence;
    let f = features::create_feature(conn, now, new)?;
    Ok(Touched { id: f.id, outcome: Outcome::Created })
}

fn decision_reasoning(g: &Group) -> String {
    g.meta("reasoning").map(str::to_string).unwrap_or_else(|| g.body.clone())
}

fn decision_summary(g: &Group) -> String {
    g.meta("summary")
        .map(str::to_string)
        .unwrap_or_else(|| g.body.lines().next().unwrap_or_default().trim().to_string())
}

fn upsert_decision(
    conn: &Connection,
    now: i64,
    ws: &str,
    g: &Group,
    feature_id: impl FnOnce(&Connection) -> Result<String>,
) -> Result<Touched> {
    if let Some(mut d) = features::find_decision(conn, ws, &g.title)? {
        let before = d.clone();
        merge_text(&mut d.reasoning, &decision_reasoning(g));
        if d.summary.is_empty() {
            d.summary = decision_summary(g);
        }
        if d.tradeoffs.is_empty() {
            d.tradeoffs = g.meta("tradeoffs").unwrap_or_default().to_string();
        }
        union_evidence(&mut d.evidence, &g.evidence);
        absorb_metadata(&mut d.metadata, g);
        apply_verdict(&mut d.verification, &mut d.confidence, g);
        if d == before {
            return Ok(Touched { id: d.id, outcome: Outcome::Unchanged });
        }
        features::update_decision(conn, now, &mut d)?;
        return Ok(Touched { id: d.id, outcome: Outcome::Merged });
    }
    let mut new = NewDecision::titled(ws, &feature_id(conn)?, &g.title);
    new.summary = decision_summary(g);
    new.reasoning = decision_reasoning(g);
    new.tradeoffs = g.meta("tradeoffs").unwrap_or_default().to_string();
    new.evidence = g.evidence.clone();
    new.metadata = g.stored_metadata();
    new.verification = g.verification;
    new.confidence = g.confidence;
    let d = features::create_decision(conn, now, new)?;
    Ok(Touched { id: d.id, outcome: Outcome::Created })
}

fn upsert_note(conn: &Connection, now: i64, ws: &str, kind: NoteKind, g: &Group) -> Result<Touched> {
    if let Some(mut n) = notes::find_note(conn, kind, ws, &g.title)? {
        let before = n.clone();
        merge_text(&mut n.body, &g.body);
        union_evidence(&mut n.evidence, &g.evidence);
        absorb_metadata(&mut n.metadata, g);
        apply_verdict(&mut n.verification, &mut n.confidence, g);
        if n == before {
            return Ok(Touched { id: n.id, outcome: Outcome::Unchanged });
        }
        notes::update_note(conn, now, &mut n)?;
        return Ok(Touched { id: n.id, outcome: Outcome::Merged });
    }
    let n = notes::create_note(
        conn,
        now,
        NewNote {
            workspace_id: ws.to_string(),
            kind,
            title: g.title.clone(),
            body: g.body.clone(),
            evidence: g.evidence.clone(),
            metadata: g.stored_metadata(),
            verification: g.verification,
            confidence: g.confidence,
        },
    )?;
    Ok(Touched { id: n.id, outcome: Outcome::Created })
}

fn symbol_from_group(ws: &str, now: i64, g: &Group) -> Result<Symbol> {
    let kind = SymbolKind::parse(g.meta("kind").unwrap_or("function"))?;
    let file_path = g
        .symbol_file()
        .ok_or_else(|| MemoryError::validation(format!("symbol '{}' has no file_path", g.title)))?
        .to_string();
    let line = |key: &str| g.meta(key).and_then(|v| v.trim().parse::<u32>().ok());
    let start_line = line("start_line").unwrap_or(1);
    Ok(Symbol {
        id: String::new(),
        workspace_id: ws.to_string(),
        name: g.title.clone(),
        kind,
        file_path,
        start_line,
        end_line: line("end_line").unwrap_or(start_line),
        signature: g.meta("signature").unwrap_or_default().to_string(),
        doc_comment: g.meta("doc_comment").unwrap_or_default().to_string(),
        module_path: g.meta("module_path").unwrap_or_default().to_string(),
        last_seen_at: now,
    })
}

fn upsert_symbol(conn: &Connection, now: i64, ws: &str, g: &Group) -> Result<Touched> {
    let mut sym = symbol_from_group(ws, now, g)?;
    let before = fts::get_doc(conn, &symbols::symbol_id(ws, &sym.file_path, sym.kind, &sym.name, &sym.signature))?;
    let created = symbols::upsert_symbol(conn, &mut sym)?;
    let after = symbols::symbol_doc(&sym);
    // last_seen_at moves every pass; only content counts as a change
    let outcome = match before {
        _ if created => Outcome::Created,
        Some(doc) if doc.summary == after.summary && doc.body == after.body => Outcome::Unchanged,
        _ => Outcome::Merged,
    };
    Ok(Touched { id: sym.id, outcome })
}

// ── Relationship resolution ─────────────────────────────────────────────────

/// Title lookup: this batch first, then what is already stored. Symbols keep
/// every same-named definition so an endpoint can pick by location.
struct Resolver<'a> {
    ws: &'a str,
    batch: HashMap<String, (FindingType, String)>,
    symbols: HashMap<String, Vec<(String, String)>>,
}

/// What a relationship endpoint title resolved to.
enum Endpoint {
    Node(String),
    /// `(file_path, id)` of every symbol with that name.
    Symbols(Vec<(String, String)>),
    Missing,
}

impl Endpoint {
    /// Keep only definitions in `file` when the producer named one that exists.
    fn narrow(self, file: Option<&str>) -> Self {
        match (self, file) {
            (Endpoint::Symbols(all), Some(file)) if all.iter().any(|(f, _)| f == file) => {
                Endpoint::Symbols(all.into_iter().filter(|(f, _)| f == file).collect())
            }
            (other, _) => other,
        }
    }

    fn sole_file(&self) -> Option<&str> {
        match self {
            Endpoint::Symbols(all) if all.len() == 1 => Some(all[0].0.as_str()),
            _ => None,
        }
    }

    /// Settle on one id. Several symbols go to the one sharing the most
    /// leading directories with `anchor`; a tie is ambiguous.
    fn pick(&self, anchor: Option<&str>) -> Picked {
        match self {
            Endpoint::Node(id) => Picked::One(id.clone()),
            Endpoint::Missing => Picked::Missing,
            Endpoint::Symbols(all) if all.len() == 1 => Picked::One(all[0].1.clone()),
            Endpoint::Symbols(all) => {
                let Some(anchor) = anchor else {
                    return Picked::Ambiguous(all.len());
                };
                let scored: Vec<(usize, &str)> = all
                    .iter()
                    .map(|(file, id)| (shared_dirs(file, anchor), id.as_str()))
                    .collect();
                let best = scored.iter().map(|(s, _)| *s).max().unwrap_or(0);
                let top: Vec<&str> = scored.iter().filter(|(s, _)| *s == best).map(|(_, id)| *id).collect();
                match top.as_slice() {
                    [id] => Picked::One(id.to_string()),
                    _ => Picked::Ambiguous(top.len()),
                }
            }
        }
    }
}

enum Picked {
    One(String),
    Missing,
    Ambiguous(usize),
}

/// Count of leading directories two slash-separated paths share; the same
/// file beats any directory match.
fn shared_dirs(a: &str, b: &str) -> usize {
    if a == b {
        return usize::MAX;
    }
    let dirs = |p: &str| -> Vec<String> {
        let mut parts: Vec<String> = p.split('/').map(str::to_string).collect();
        parts.pop();
        parts
    };
    dirs(a).iter().zip(dirs(b).iter()).take_while(|(x, y)| x == y).count()
}

impl<'a> Resolver<'a> {
    fn new(ws: &'a str) -> Self {
        Resolver {
            ws,
            batch: HashMap::new(),
            symbols: HashMap::new(),
        }
    }

    fn remember(&mut self, g: &Group, id: &str) {
        if g.kind == FindingType::Symbol {
            if let Some(file) = g.symbol_file() {
                self.symbols
                    .entry(g.key.clone())
                    .or_default()
                    .push((file.to_string(), id.to_string()));
            }
            return;
        }
        self.batch
            .entry(g.key.clone())
            .or_insert_with(|| (g.kind, id.to_string()));
    }

    fn feature(&self, conn: &Connection, title: &str) -> Result<Option<String>> {
        match self.batch.get(&canonical_title(title)) {
            Some((FindingType::Feature, id)) => Ok(Some(id.clone())),
            _ => Ok(features::find_feature(conn, self.ws, title)?.map(|f| f.id)),
        }
    }

    fn lookup(&self, conn: &Connection, title: &str) -> Result<Endpoint> {
        let key = canonical_title(title);
        if let Some((_, id)) = self.batch.get(&key) {
            return Ok(Endpoint::Node(id.clone()));
        }
        let batch_symbols = self.symbols.get(&key);
        if batch_symbols.is_none() {
            if let Some(f) = features::find_feature(conn, self.ws, title)? {
                return Ok(Endpoint::Node(f.id));
            }
            if let Some(d) = features::find_decision(conn, self.ws, title)? {
                return Ok(Endpoint::Node(d.id));
            }
            for kind in [NoteKind::Pattern, NoteKind::Constraint] {
                if let Some(n) = notes::find_note(conn, kind, self.ws, title)? {
                    return Ok(Endpoint::Node(n.id));
                }
            }
        }
        let mut all: Vec<(String, String)> = batch_symbols.cloned().unwrap_or_default();
        for s in symbols::find_symbols_by_name(conn, self.ws, title.trim())? {
            if !all.iter().any(|(_, id)| *id == s.id) {
                all.push((s.file_path, s.id));
            }
        }
        Ok(if all.is_empty() { Endpoint::Missing } else { Endpoint::Symbols(all) })
    }
}

/// Feature a new decision hangs off: metadata, then a relationship, then General.
fn owning_feature(
    conn: &Connection,
    now: i64,
    resolver: &Resolver<'_>,
    g: &Group,
    relations: &[FindingRelation],
) -> Result<String> {
    if let Some(name) = g.meta("feature") {
        if let Some(id) = resolver.feature(conn, name)? {
            return Ok(id);
        }
    }
    for r in relations {
        let other = if canonical_title(&r.from_title) == g.key {
            &r.to_title
        } else if canonical_title(&r.to_title) == g.key {
            &r.from_title
        } else {
            continue;
        };
        if let Some(id) = resolver.feature(conn, other)? {
            return Ok(id);
        }
    }
    Ok(features::ensure_general_feature(conn, now, resolver.ws)?.id)
}

fn link_relations(
    conn: &Connection,
    now: i64,
    resolver: &Resolver<'_>,
    relations: &[FindingRelation],
    report: &mut IngestReport,
) -> Result<()> {
    for r in relations {
        let from = resolver.lookup(conn, &r.from_title)?.narrow(r.from_file.as_deref());
        let to = resolver.lookup(conn, &r.to_title)?.narrow(r.to_file.as_deref());
        let picked = (
            from.pick(to.sole_file().or(r.to_file.as_deref())),
            to.pick(from.sole_file().or(r.from_file.as_deref())),
        );
        let (from, to) = match picked {
            (Picked::One(from), Picked::One(to)) => (from, to),
            (Picked::Ambiguous(n), _) | (_, Picked::Ambiguous(n)) => {
                report.relationships_dropped += 1;
                report.warn(format!(
                    "dropped {} '{}' -> '{}': endpoint matches {n} symbols in different places",
                    r.kind.as_str(),
                    r.from_title,
                    r.to_title
                ));
                continue;
            }
            _ => {
                report.relationships_dropped += 1;
                report.warn(format!(
                    "dropped {} '{}' -> '{}': unresolved endpoint",
                    r.kind.as_str(),
                    r.from_title,
                    r.to_title
                ));
                continue;
            }
        };
        if from == to {
            report.relationships_dropped += 1;
            report.warn(format!("dropped self-referencing {} on '{}'", r.kind.as_str(), r.from_title));
            continue;
        }
        let mut edge = Edge::new(from, to, r.kind);
        edge.confidence = r.confidence.clamp(0.0, 1.0);
        edge.evidence = r.evidence.clone();
        if let Err(err) = graph::cycle_check(conn, &edge) {
            if let Some(MemoryError::CycleWould { .. }) = domain_error(&err) {
                report.relationships_dropped += 1;
                report.warn(format!("dropped '{}' -> '{}': {err}", r.from_title, r.to_title));
                continue;
            }
            return Err(err);
        }
        if edges::add_edge(conn, now, &edge)? {
            report.edges_created += 1;
        } else {
            report.edges_existing += 1;
        }
    }
    Ok(())
}

// ── Embedding ───────────────────────────────────────────────────────────────

/// Embed `ids` and store their vectors; every failure surfaces. Documents
/// are read and vectors computed without the writer lock. Each batch is
/// stored in its own short write that skips nodes deleted or rewritten while
/// the embedder ran. Returns how many vectors were stored.
pub(crate) fn embed_strict(
    repo: &Repo,
    embedder: &dyn Embedder,
    ids: &[String],
    cancel: &CancelToken,
) -> Result<usize> {
    let tag = embedder.model_tag();
    let docs: Vec<NodeDoc> = repo.read(|c| {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = fts::get_doc(c, id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    })?;
    let mut embedded = 0;
    for chunk in docs.chunks(EMBED_BATCH) {
        cancel.check()?;
        let texts: Vec<String> = chunk.iter().map(NodeDoc::embed_text).collect();
        let vecs = embedder.embed_batch(&texts, EmbedRole::Document, cancel)?;
        embedded += repo.write(|tx| {
            let mut stored = 0;
            for ((doc, text), vec) in chunk.iter().zip(&texts).zip(vecs) {
                match fts::get_doc(tx, &doc.node_id)? {
                    Some(current) if current.embed_text() == *text => {
                        vectors::put_vector(tx, &doc.node_id, &tag, &vec)?;
                        stored += 1;
                    }
                    _ => debug!(node = %doc.node_id, "node changed while embedding, vector skipped"),
                }
            }
            Ok(stored)
        })?;
    }
    Ok(embedded)
}

/// Like `embed_strict`, but runs after the nodes are committed: provider
/// failures and cancellation degrade to keyword-only search with a warning.
pub(crate) fn embed_nodes(
    repo: &Repo,
    embedder: &dyn Embedder,
    ids: &[String],
    cancel: &CancelToken,
    report: &mut IngestReport,
) -> Result<()> {
    match embed_strict(repo, embedder, ids, cancel) {
        Ok(n) => {
            report.embedded += n;
            Ok(())
        }
        Err(err) if is_cancelled(&err) => {
            report.embeddings_degraded = true;
            report.warn("embedding interrupted; missing vectors are filled by the next refresh".to_string());
            Ok(())
        }
        Err(err) if matches!(domain_error(&err), Some(MemoryError::External { .. })) => {
            report.embeddings_degraded = true;
            report.warn(format!("embedding skipped, search falls back to keywords: {err}"));
            Ok(())
        }
        Err(err) => Err(err),
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub(crate) fn ingest(
    repo: &Repo,
    providers: &Providers,
    files: &dyn FileSource,
    workspace_id: &str,
    findings: &[Finding],
    relations: &[FindingRelation],
    opts: &IngestOptions,
) -> Result<IngestReport> {
    opts.cancel.check()?;
    let mut report = IngestReport {
        findings: findings.len(),
        ..IngestReport::default()
    };
    let mut groups = group_findings(findings);
    if opts.verify_evidence {
        verify_groups(files, &mut groups, &mut report)?;
    }
    debug!(findings = findings.len(), groups = groups.len(), "ingest grouped");

    let now = repo.now_millis();
    let embedder = providers.embedder.as_ref();
    let (mut report, to_embed) = repo.write(|tx| {
        let conn: &Connection = tx;
        let mut resolver = Resolver::new(workspace_id);
        let mut touched: Vec<Touched> = Vec::new();

        for g in groups.iter().filter(|g| g.kind == FindingType::Feature) {
            let t = upsert_feature(conn, now, workspace_id, g, &mut report)?;
            resolver.remember(g, &t.id);
            report.ids.insert(g.title.clone(), t.id.clone());
            touched.push(t);
        }
        opts.cancel.check()?;
        for g in groups.iter().filter(|g| g.kind == FindingType::Decision) {
            let t = upsert_decision(conn, now, workspace_id, g, |c| {
                owning_feature(c, now, &resolver, g, relations)
            })?;
            resolver.remember(g, &t.id);
            report.ids.insert(g.title.clone(), t.id.clone());
            touched.push(t);
        }
        for g in &groups {
            let t = match g.kind {
                FindingType::Pattern => upsert_note(conn, now, workspace_id, NoteKind::Pattern, g)?,
                FindingType::Constraint => upsert_note(conn, now, workspace_id, NoteKind::Constraint, g)?,
                FindingType::Symbol => match upsert_symbol(conn, now, workspace_id, g) {
                    Ok(t) => t,
                    Err(err) if matches!(domain_error(&err), Some(MemoryError::Validation(_))) => {
                        report.warn(format!("skipped symbol '{}': {err}", g.title));
                        continue;
                    }
                    Err(err) => return Err(err),
                },
                FindingType::Feature | FindingType::Decision => continue,
            };
            resolver.remember(g, &t.id);
            report.ids.insert(g.title.clone(), t.id.clone());
            touched.push(t);
        }
        opts.cancel.check()?;

        for t in &touched {
            match t.outcome {
                Outcome::Created => report.nodes_created += 1,
                Outcome::Merged => report.nodes_merged += 1,
                Outcome::Unchanged => report.nodes_unchanged += 1,
            }
        }

        link_relations(conn, now, &resolver, relations, &mut report)?;

        let mut to_embed = Vec::new();
        if let Some(embedder) = embedder {
            let tag = embedder.model_tag();
            for t in &touched {
                let stale = t.outcome != Outcome::Unchanged;
                if stale || vectors::get_vector(conn, &t.id, &tag)?.is_none() {
                    to_embed.push(t.id.clone());
                }
            }
        }
        Ok((report, to_embed))
    })?;

    if let Some(embedder) = embedder {
        embed_nodes(repo, embedder.as_ref(), &to_embed, &opts.cancel, &mut report)?;
    }

    info!(
        created = report.nodes_created,
        merged = report.nodes_merged,
        unchanged = report.nodes_unchanged,
        edges = report.edges_created,
        embedded = report.embedded,
        warnings = report.warnings.len(),
        "ingest committed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::evidence::evidence_ref;
    use crate::memory::model::EdgeKind;
    use crate::memory::testutil::{repo, WS};
    use crate::providers::fakes::DownEmbedder;
    use crate::providers::local::LocalEmbedder;
    use crate::providers::FsSource;
    use crate::write_lock::FileLockGuard;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn auth_findings() -> (Vec<Finding>, Vec<FindingRelation>) {
        (
            vec![
                Finding::new("docs", FindingType::Feature, "Auth").with_meta("one_liner", "JWT auth"),
                Finding::new("docs", FindingType::Decision, "Use JWT").with_meta("reasoning", "stateless"),
            ],
            vec![FindingRelation::new("Use JWT", "Auth", EdgeKind::Implements)],
        )
    }

    fn local() -> Providers {
        Providers::none().with_embedder(Arc::new(LocalEmbedder::default()))
    }

    #[test]
    fn decision_attaches_through_relationship() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let (findings, rels) = auth_findings();
        let report = ingest(&repo, &local(), &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(report.nodes_created, 2);
        assert_eq!(report.edges_created, 1);
        assert_eq!(report.embedded, 2);

        let feats = repo.read(|c| features::list_features(c, WS)).unwrap();
        assert_eq!(feats.len(), 1);
        assert_eq!(feats[0].name, "Auth");
        assert_eq!(feats[0].decision_count, 1);
    }

    #[test]
    fn second_ingest_is_a_no_op() {
        let (_tmp, repo, clock) = repo();
        let src = TempDir::new().unwrap();
        let files = FsSource::new(src.path());
        let (findings, rels) = auth_findings();
        let first = ingest(&repo, &local(), &files, WS, &findings, &rels, &IngestOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(60));
        let second = ingest(&repo, &local(), &files, WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(first.ids, second.ids);
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_unchanged, 2);
        assert_eq!(second.edges_existing, 1);
        assert_eq!(second.embedded, 0);
    }

    #[test]
    fn duplicates_merge_by_canonical_title() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let findings = vec![
            Finding::new("a", FindingType::Feature, "Auth").with_body("Login flow").with_meta("tags", "security"),
            Finding::new("b", FindingType::Feature, "  auth ").with_body("Token refresh").with_meta("tags", "jwt"),
        ];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &[], &IngestOptions::default()).unwrap();
        assert_eq!(report.nodes_created, 1);
        let f = repo.read(|c| features::find_feature(c, WS, "AUTH")).unwrap().unwrap();
        assert!(f.body.contains("Login flow") && f.body.contains("Token refresh"));
        assert_eq!(f.tags.len(), 2);
    }

    #[test]
    fn unresolved_relationship_is_a_warning() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let findings = vec![Finding::new("a", FindingType::Feature, "Auth")];
        let rels = vec![FindingRelation::new("Auth", "Billing", EdgeKind::DependsOn)];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(report.relationships_dropped, 1);
        assert!(report.warnings.iter().any(|w| w.contains("Billing")));
    }

    #[test]
    fn stale_evidence_marks_unverified() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src")).unwrap();
        let original: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let ev = evidence_ref("src/foo.rs", &original, 10, 20);
        std::fs::write(src.path().join("src/foo.rs"), original.replace("line 15", "changed")).unwrap();

        let findings = vec![Finding::new("docs", FindingType::Decision, "Use SQLite")
            .with_body("embedded store")
            .with_confidence(0.8)
            .with_evidence(ev)];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &[], &IngestOptions::default()).unwrap();
        assert_eq!(report.unverified, 1);
        let d = repo.read(|c| features::find_decision(c, WS, "Use SQLite")).unwrap().unwrap();
        assert_eq!(d.verification, Verification::Unverified);
        assert!((d.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn embedder_outage_degrades() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let (findings, rels) = auth_findings();
        let providers = Providers::none().with_embedder(Arc::new(DownEmbedder));
        let report = ingest(&repo, &providers, &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert!(report.embeddings_degraded);
        assert_eq!(report.nodes_created, 2);
    }

    #[test]
    fn cancelled_ingest_writes_nothing() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let (findings, rels) = auth_findings();
        let opts = IngestOptions::default();
        opts.cancel.cancel();
        let err = ingest(&repo, &local(), &FsSource::new(src.path()), WS, &findings, &rels, &opts).unwrap_err();
        assert!(is_cancelled(&err));
        assert!(repo.read(|c| features::list_features(c, WS)).unwrap().is_empty());
    }

    #[test]
    fn symbols_need_a_file() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let findings = vec![
            Finding::new("symbols", FindingType::Symbol, "parse_config")
                .with_meta("kind", "function")
                .with_meta("file_path", "src/config.rs")
                .with_meta("start_line", "12"),
            Finding::new("symbols", FindingType::Symbol, "orphan"),
        ];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &[], &IngestOptions::default()).unwrap();
        assert_eq!(report.nodes_created, 1);
        assert_eq!(report.warnings.len(), 1);
        let syms = repo.read(|c| symbols::list_symbols(c, WS, None)).unwrap();
        assert_eq!(syms[0].start_line, 12);
    }

    fn sym(name: &str, file: &str) -> Finding {
        Finding::new("symbols", FindingType::Symbol, name)
            .with_meta("kind", "function")
            .with_meta("file_path", file)
    }

    fn call_pairs(repo: &Repo) -> Vec<(String, String)> {
        repo.read(|c| {
            let by_id: HashMap<String, String> = symbols::list_symbols(c, WS, None)?
                .into_iter()
                .map(|s| (s.id, s.file_path))
                .collect();
            Ok(edges::list_workspace_edges(c, WS)?
                .into_iter()
                .filter(|e| e.kind == EdgeKind::Calls)
                .map(|e| (by_id[&e.from_id].clone(), by_id[&e.to_id].clone()))
                .collect())
        })
        .unwrap()
    }

    #[test]
    fn calls_bind_to_the_nearest_same_named_symbol() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let findings = vec![
            sym("parse", "api/src/lib.rs"),
            sym("parse", "web/src/lib.rs"),
            sym("handle", "web/src/main.rs"),
        ];
        let rels = vec![FindingRelation::new("handle", "parse", EdgeKind::Calls)];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(report.edges_created, 1);
        assert_eq!(call_pairs(&repo), vec![("web/src/main.rs".to_string(), "web/src/lib.rs".to_string())]);
    }

    #[test]
    fn file_hints_pick_the_symbol_and_ties_are_dropped() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let findings = vec![
            sym("parse", "api/src/lib.rs"),
            sym("parse", "web/src/lib.rs"),
            sym("run", "cli/main.rs"),
            sym("handle", "web/src/main.rs"),
        ];
        let rels = vec![
            FindingRelation::new("run", "parse", EdgeKind::Calls),
            FindingRelation::new("handle", "parse", EdgeKind::Calls)
                .between_files(Some("web/src/main.rs".into()), Some("api/src/lib.rs".into())),
        ];
        let report = ingest(&repo, &Providers::none(), &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(report.relationships_dropped, 1);
        assert!(report.warnings.iter().any(|w| w.contains("'run' -> 'parse'") && w.contains("2 symbols")));
        assert_eq!(call_pairs(&repo), vec![("web/src/main.rs".to_string(), "api/src/lib.rs".to_string())]);
    }

    /// Notes whether the writer file lock was free while it was called.
    struct LockAwareEmbedder {
        db: std::path::PathBuf,
        lock_free: AtomicBool,
    }

    impl Embedder for LockAwareEmbedder {
        fn model_tag(&self) -> String {
            "lock-aware".into()
        }

        fn embed_batch(&self, texts: &[String], _: EmbedRole, _: &CancelToken) -> Result<Vec<Vec<f32>>> {
            let free = FileLockGuard::try_acquire(&self.db)?.is_some();
            self.lock_free.store(free, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.5]).collect())
        }
    }

    #[test]
    fn embedder_runs_without_the_writer_lock() {
        let (_tmp, repo, _) = repo();
        let src = TempDir::new().unwrap();
        let embedder = Arc::new(LockAwareEmbedder {
            db: repo.path().to_path_buf(),
            lock_free: AtomicBool::new(false),
        });
        let providers = Providers::none().with_embedder(embedder.clone());
        let (findings, rels) = auth_findings();
        let report = ingest(&repo, &providers, &FsSource::new(src.path()), WS, &findings, &rels, &IngestOptions::default()).unwrap();
        assert_eq!(report.embedded, 2);
        assert!(!report.embeddings_degraded);
        assert!(embedder.lock_free.load(Ordering::SeqCst));
        assert_eq!(repo.read(|c| vectors::count_vectors(c, WS, "lock-aware")).unwrap(), 2);
    }
}
