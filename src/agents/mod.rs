//! Deterministic analyzers that turn a checkout into findings.
//!
//! Agents only read: they get an immutable file snapshot and return an
//! [`AgentOutput`]. Writing happens once, in [`bootstrap`], after every agent
//! has returned.

pub mod bootstrap;
pub mod call_graph;
pub mod conventions;
pub mod docs;
pub mod manifest;
pub mod runtime;
pub mod stream;
pub mod symbols;

use anyhow::Result;
use ignore::WalkBuilder;
use serde::{Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::knowledge::evidence;
use crate::memory::model::{EvidenceRef, Finding, FindingRelation, Metadata};
use stream::{EventType, StreamingOutput};

/// Directories never worth analysing.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".taskwing",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    ".venv",
    "venv",
    "__pycache__",
    "vendor",
];

// ── File snapshot ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Go,
    Java,
    Markdown,
    Other,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "md" | "markdown" => Language::Markdown,
            _ => Language::Other,
        }
    }

    pub fn is_code(self) -> bool {
        !matches!(self, Language::Markdown | Language::Other)
    }
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Slash-separated, relative to the analysed root.
    pub rel_path: String,
    pub content: String,
    pub language: Language,
}

impl SourceFile {
    pub fn new(rel_path: &str, content: &str) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            content: content.to_string(),
            language: Language::from_path(rel_path),
        }
    }

    /// Hashed reference to lines `start..=end` of this file.
    pub fn evidence(&self, start: u32, end: u32) -> EvidenceRef {
        evidence::evidence_ref(&self.rel_path, &self.content, start, end)
    }

    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileSet {
    pub files: Vec<SourceFile>,
    /// Files skipped for size or encoding.
    pub skipped: usize,
}

impl FileSet {
    pub fn get(&self, rel_path: &str) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.rel_path == rel_path)
    }

    pub fn code(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter().filter(|f| f.language.is_code())
    }
}

fn should_skip_rel_path(path: &Path) -> bool {
    path.components()
        .any(|c| EXCLUDED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
}

/// Gitignore-aware walk of `root`, loading text files up to `max_file_bytes`.
pub fn scan_files(root: &Path, max_file_bytes: u64, cancel: &CancelToken) -> Result<FileSet> {
    let mut set = FileSet::default();
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .parents(true)
        .follow_links(false);

    for entry in builder.build() {
        cancel.check()?;
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let abs = entry.path();
        let Ok(rel) = abs.strip_prefix(root) else { continue };
        if should_skip_rel_path(rel) {
            continue;
        }
        let Ok(meta) = fs::metadata(abs) else { continue };
        if meta.len() > max_file_bytes {
            set.skipped += 1;
            continue;
        }
        let Ok(bytes) = fs::read(abs) else { continue };
        match String::from_utf8(bytes) {
            Ok(content) => set.files.push(SourceFile::new(&rel.to_string_lossy().replace('\\', "/"), &content)),
            Err(_) => set.skipped += 1,
        }
    }
    set.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(set)
}

// ── Agent contract ──────────────────────────────────────────────────────────

pub struct AgentInput {
    /// Directory the agent analyses (workspace root or one service).
    pub root: PathBuf,
    pub service: Option<String>,
    pub files: Arc<FileSet>,
    pub cancel: CancelToken,
    pub stream: Arc<StreamingOutput>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Coverage {
    pub files_total: usize,
    pub files_analyzed: usize,
}

impl Coverage {
    pub fn percent(&self) -> f64 {
        if self.files_total == 0 {
            return 100.0;
        }
        (self.files_analyzed as f64 / self.files_total as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AgentError {
    Cancelled,
    Failed(String),
    Panicked(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Cancelled => f.write_str("cancelled"),
            AgentError::Failed(m) => write!(f, "failed: {m}"),
            AgentError::Panicked(m) => write!(f, "panicked: {m}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedOverview {
    pub short: String,
    pub long: String,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutput {
    pub agent: String,
    pub findings: Vec<Finding>,
    pub relationships: Vec<FindingRelation>,
    pub coverage: Coverage,
    pub tokens_used: u64,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<ProposedOverview>,
}

impl AgentOutput {
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            findings: Vec::new(),
            relationships: Vec::new(),
            coverage: Coverage::default(),
            tokens_used: 0,
            duration: Duration::ZERO,
            error: None,
            overview: None,
        }
    }

    pub fn failed(agent: &str, error: AgentError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(agent)
        }
    }

    /// Start on `file`; false (and the output marked cancelled) once the
    /// run was cancelled, in which case the agent should return what it has.
    pub fn consider(&mut self, input: &AgentInput, file: &SourceFile) -> bool {
        if input.cancel.is_cancelled() {
            self.error = Some(AgentError::Cancelled);
            return false;
        }
        self.coverage.files_analyzed += 1;
        input.stream.emit(&self.agent, EventType::FileConsidered, file.rel_path.as_str());
        true
    }

    pub fn push(&mut self, input: &AgentInput, finding: Finding) {
        let mut meta = Metadata::new();
        meta.insert("type".into(), format!("{:?}", finding.finding_type).to_lowercase());
        input
            .stream
            .publish(&self.agent, EventType::FindingEmitted, finding.title.as_str(), meta);
        self.findings.push(finding);
    }

    pub fn relate(&mut self, relation: FindingRelation) {
        self.relationships.push(relation);
    }
}

/// A read-only analyzer. Implementations must not write shared state.
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, input: &AgentInput) -> Result<AgentOutput>;
}

pub fn default_agents() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(manifest::ManifestAgent),
        Arc::new(symbols::SymbolAgent),
        Arc::new(call_graph::CallGraphAgent),
        Arc::new(docs::DocsAgent),
        Arc::new(conventions::ConventionsAgent),
    ]
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::clock::FixedClock;

    pub fn input(files: &[(&str, &str)]) -> AgentInput {
        AgentInput {
            root: PathBuf::from("."),
            service: None,
            files: Arc::new(FileSet {
                files: files.iter().map(|(p, c)| SourceFile::new(p, c)).collect(),
                skipped: 0,
            }),
            cancel: CancelToken::new(),
            stream: Arc::new(StreamingOutput::new(256, Arc::new(FixedClock::at_millis(0)))),
        }
    }
}
