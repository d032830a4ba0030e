//! Typed entities of the knowledge graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type Metadata = BTreeMap<String, String>;

// ── Enumerations ────────────────────────────────────────────────────────────

/// Implements `as_str`/`parse` over a fixed set of snake_case tags.
macro_rules! tagged_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $tag),+
                }
            }

            pub fn parse(raw: &str) -> Result<Self, $crate::error::MemoryError> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($tag => Ok($ty::$variant),)+
                    other => Err($crate::error::MemoryError::validation(format!(
                        "unknown {}: '{}'", $what, other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
pub(crate) use tagged_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Feature,
    Decision,
    Symbol,
    Pattern,
    Constraint,
    Overview,
}

tagged_enum!(NodeType, "node type", {
    Feature => "feature",
    Decision => "decision",
    Symbol => "symbol",
    Pattern => "pattern",
    Constraint => "constraint",
    Overview => "overview",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Active,
    Deprecated,
    Planned,
}

tagged_enum!(FeatureStatus, "feature status", {
    Active => "active",
    Deprecated => "deprecated",
    Planned => "planned",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Struct,
    Interface,
    Type,
    Variable,
    Constant,
    Field,
    Package,
    Module,
}

tagged_enum!(SymbolKind, "symbol kind", {
    Function => "function",
    Method => "method",
    Struct => "struct",
    Interface => "interface",
    Type => "type",
    Variable => "variable",
    Constant => "constant",
    Field => "field",
    Package => "package",
    Module => "module",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    DependsOn,
    Extends,
    Replaces,
    Related,
    Calls,
    Implements,
}

tagged_enum!(EdgeKind, "edge kind", {
    DependsOn => "depends_on",
    Extends => "extends",
    Replaces => "replaces",
    Related => "related",
    Calls => "calls",
    Implements => "implements",
});

impl EdgeKind {
    /// Kinds whose graph must stay acyclic.
    pub fn is_dependency(self) -> bool {
        matches!(self, EdgeKind::DependsOn | EdgeKind::Calls)
    }

    pub fn is_symmetric(self) -> bool {
        self == EdgeKind::Related
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
    Both,
}

/// Outcome of evidence checking at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Unverified,
    Unchecked,
}

tagged_enum!(Verification, "verification", {
    Verified => "verified",
    Unverified => "unverified",
    Unchecked => "unchecked",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    Single,
    Monorepo,
    MultiRepo,
}

tagged_enum!(WorkspaceKind, "workspace kind", {
    Single => "single",
    Monorepo => "monorepo",
    MultiRepo => "multi_repo",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FindingType {
    Feature,
    Decision,
    Symbol,
    Pattern,
    Constraint,
}

impl FindingType {
    pub fn node_type(self) -> NodeType {
        match self {
            FindingType::Feature => NodeType::Feature,
            FindingType::Decision => NodeType::Decision,
            FindingType::Symbol => NodeType::Symbol,
            FindingType::Pattern => NodeType::Pattern,
            FindingType::Constraint => NodeType::Constraint,
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub root_path: String,
    pub kind: WorkspaceKind,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub snippet_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub one_liner: String,
    pub body: String,
    pub tags: BTreeSet<String>,
    pub status: FeatureStatus,
    pub metadata: Metadata,
    pub verification: Verification,
    pub confidence: f64,
    /// Derived on read; never stored.
    pub decision_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
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
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub doc_comment: String,
    pub module_path: String,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Pattern,
    Constraint,
}

impl NoteKind {
    pub fn table(self) -> &'static str {
        match self {
            NoteKind::Pattern => "pattern",
            NoteKind::Constraint => "\"constraint\"",
        }
    }

    pub fn node_type(self) -> NodeType {
        match self {
            NoteKind::Pattern => NodeType::Pattern,
            NoteKind::Constraint => NodeType::Constraint,
        }
    }
}

/// Pattern or Constraint: a project-wide note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub workspace_id: String,
    pub kind: NoteKind,
    pub title: String,
    pub body: String,
    pub evidence: Vec<EvidenceRef>,
    pub metadata: Metadata,
    pub verification: Verification,
    pub confidence: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub workspace_id: String,
    pub short_description: String,
    pub long_description: String,
    pub generated_at: Option<i64>,
    pub last_edited_at: Option<i64>,
}

impl Overview {
    pub fn node_id_for(workspace_id: &str) -> String {
        format!("overview:{workspace_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    pub kind: EdgeKind,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl Edge {
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            kind,
            confidence: 1.0,
            evidence: None,
        }
    }

    /// Storage form: `related` edges keep `from_id < to_id`.
    pub fn normalized(mut self) -> Self {
        if self.kind.is_symmetric() && self.from_id > self.to_id {
            std::mem::swap(&mut self.from_id, &mut self.to_id);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Feature(Feature),
    Decision(Decision),
    Symbol(Symbol),
    Pattern(Note),
    Constraint(Note),
    Overview(Overview),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Feature(_) => NodeType::Feature,
            Node::Decision(_) => NodeType::Decision,
            Node::Symbol(_) => NodeType::Symbol,
            Node::Pattern(_) => NodeType::Pattern,
            Node::Constraint(_) => NodeType::Constraint,
            Node::Overview(_) => NodeType::Overview,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Node::Feature(f) => f.id.clone(),
            Node::Decision(d) => d.id.clone(),
            Node::Symbol(s) => s.id.clone(),
            Node::Pattern(n) | Node::Constraint(n) => n.id.clone(),
            Node::Overview(o) => Overview::node_id_for(&o.workspace_id),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Node::Feature(f) => &f.name,
            Node::Decision(d) => &d.title,
            Node::Symbol(s) => &s.name,
            Node::Pattern(n) | Node::Constraint(n) => &n.title,
            Node::Overview(o) => &o.short_description,
        }
    }
}

// ── Agent output ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub agent: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
    #[serde(default)]
    pub metadata: Metadata,
    pub confidence: f64,
}

impl Finding {
    pub fn new(agent: &str, finding_type: FindingType, title: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            finding_type,
            title: title.into(),
            body: String::new(),
            evidence: Vec::new(),
            metadata: Metadata::new(),
            confidence: 1.0,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceRef) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Relationship proposed by an agent, endpoints named by title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRelation {
    pub from_title: String,
    pub to_title: String,
    pub kind: EdgeKind,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Where a symbol endpoint is defined, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_file: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

impl FindingRelation {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            from_title: from.into(),
            to_title: to.into(),
            kind,
            confidence: 1.0,
            evidence: None,
            from_file: None,
            to_file: None,
        }
    }

    pub fn between_files(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from_file = from;
        self.to_file = to;
        self
    }
}

// ── Search plumbing ─────────────────────────────────────────────────────────

/// A scored hit from one retrieval channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHit {
    pub node_id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub workspace_id: Option<String>,
    pub node_types: Option<Vec<NodeType>>,
    pub include_symbols: bool,
    pub include_unverified: bool,
}

impl SearchFilters {
    pub fn for_workspace(workspace_id: &str) -> Self {
        Self {
            workspace_id: Some(workspace_id.to_string()),
            ..Self::default()
        }
    }

    /// Symbols stay out unless asked for, either by flag or by naming the
    /// type in an explicit filter.
    pub fn wants_symbols(&self) -> bool {
        self.include_symbols
            || self
                .node_types
                .as_ref()
                .is_some_and(|types| types.contains(&NodeType::Symbol))
    }

    /// SQL predicate over a `node_doc` alias `d`, plus its positional params.
    pub(crate) fn sql_predicate(&self, first_param: usize) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut next = first_param;
        if let Some(ws) = &self.workspace_id {
            clauses.push(format!("d.workspace_id = ?{next}"));
            params.push(ws.clone());
            next += 1;
        }
        if let Some(types) = &self.node_types {
            let mut marks = Vec::new();
            for t in types {
                marks.push(format!("?{next}"));
                params.push(t.as_str().to_string());
                next += 1;
            }
            if marks.is_empty() {
                clauses.push("0".to_string());
            } else {
                clauses.push(format!("d.node_type IN ({})", marks.join(", ")));
            }
        }
        if !self.wants_symbols() {
            clauses.push("d.node_type <> 'symbol'".to_string());
        }
        if !self.include_unverified {
            clauses.push("d.verification <> 'unverified'".to_string());
        }
        if clauses.is_empty() {
            ("1".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }
}

/// Canonical form used for dedupe: lowercased, whitespace collapsed.
pub fn canonical_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_title_collapses_whitespace_and_case() {
        assert_eq!(canonical_title("  Use   JWT\tTokens "), "use jwt tokens");
        assert_eq!(canonical_title("AUTH"), canonical_title("auth"));
    }

    #[test]
    fn related_edges_normalize_ordering() {
        let e = Edge::new("b", "a", EdgeKind::Related).normalized();
        assert_eq!((e.from_id.as_str(), e.to_id.as_str()), ("a", "b"));
        let d = Edge::new("b", "a", EdgeKind::DependsOn).normalized();
        assert_eq!(d.from_id, "b");
    }

    #[test]
    fn tags_parse_case_insensitively() {
        assert_eq!(EdgeKind::parse("Depends_On").unwrap(), EdgeKind::DependsOn);
        assert_eq!(WorkspaceKind::parse("multi_repo").unwrap(), WorkspaceKind::MultiRepo);
        assert!(SymbolKind::parse("closure").is_err());
    }

    #[test]
    fn filter_predicate_defaults_hide_symbols_and_unverified() {
        let (sql, params) = SearchFilters::for_workspace("ws").sql_predicate(2);
        assert!(sql.contains("d.workspace_id = ?2"));
        assert!(sql.contains("'symbol'"));
        assert!(sql.contains("'unverified'"));
        assert_eq!(params, vec!["ws".to_string()]);
    }

    #[test]
    fn symbol_type_filter_implies_symbols() {
        let mut filters = SearchFilters::for_workspace("ws");
        filters.node_types = Some(vec![NodeType::Symbol, NodeType::Feature]);
        assert!(filters.wants_symbols());
        let (sql, params) = filters.sql_predicate(1);
        assert!(!sql.contains("<> 'symbol'"), "{sql}");
        assert_eq!(params, vec!["ws", "symbol", "feature"]);

        filters.node_types = Some(vec![NodeType::Feature]);
        assert!(!filters.wants_symbols());
        assert!(filters.sql_predicate(1).0.contains("<> 'symbol'"));
    }
}
