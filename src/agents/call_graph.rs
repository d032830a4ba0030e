//! Static call graph over public functions and methods.
//!
//! One Aho-Corasick automaton over every public callable name scans each
//! file once. A hit counts as a call site when it is a whole word followed by
//! `(` or `::` and the line is not the callee's own definition. The caller is
//! the innermost public callable whose span contains the line.

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};

use super::symbols::{self, ExtractedSymbol};
use super::{Agent, AgentInput, AgentOutput, SourceFile};
use crate::memory::model::{EdgeKind, FindingRelation, SymbolKind};

pub const AGENT: &str = "call_graph";
/// Shorter names match too much prose and punctuation.
const MIN_NAME_LEN: usize = 3;

fn is_callable(s: &ExtractedSymbol) -> bool {
    s.public && matches!(s.kind, SymbolKind::Function | SymbolKind::Method) && s.name.len() >= MIN_NAME_LEN
}

fn is_ident(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// True when the line declares `symbol` rather than calling it.
pub fn is_definition(line: &str, symbol: &str) -> bool {
    [
        format!("fn {symbol}"),
        format!("def {symbol}("),
        format!("function {symbol}("),
        format!("const {symbol} ="),
        format!("func {symbol}("),
        format!(") {symbol}("),
    ]
    .iter()
    .any(|p| line.contains(p.as_str()))
        && !line.trim_start().starts_with("return")
}

fn is_call_at(line: &str, start: usize, end: usize) -> bool {
    if line[..start].chars().next_back().is_some_and(is_ident) {
        return false;
    }
    let rest = &line[end..];
    rest.starts_with('(') || rest.starts_with("::")
}

/// One caller-to-callee link. `callee_file` is known when the callee is
/// defined in the caller's file or in exactly one file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallEdge {
    pub caller: String,
    pub caller_file: String,
    pub callee: String,
    pub callee_file: Option<String>,
}

/// Call edges, deduplicated and sorted.
pub fn call_edges(files: &[&SourceFile]) -> Result<BTreeSet<CallEdge>> {
    let extracted: Vec<(&SourceFile, Vec<ExtractedSymbol>)> = files
        .iter()
        .map(|f| (*f, symbols::extract(f).symbols))
        .collect();

    let mut defined_in: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for (file, syms) in &extracted {
        for s in syms.iter().filter(|s| is_callable(s)) {
            defined_in.entry(s.name.as_str()).or_default().insert(file.rel_path.as_str());
        }
    }
    let mut names: Vec<String> = defined_in.keys().map(|n| n.to_string()).collect();
    names.sort();
    let mut edges = BTreeSet::new();
    if names.is_empty() {
        return Ok(edges);
    }
    let ac = AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(&names)
        .context("Failed to build call-site matcher")?;

    for (file, syms) in &extracted {
        let callers: Vec<&ExtractedSymbol> = syms.iter().filter(|s| is_callable(s)).collect();
        if callers.is_empty() {
            continue;
        }
        for (idx, line) in file.content.lines().enumerate() {
            let line_num = (idx + 1) as u32;
            let Some(caller) = callers
                .iter()
                .filter(|s| s.start_line <= line_num && line_num <= s.end_line)
                .min_by_key(|s| s.end_line - s.start_line)
            else {
                continue;
            };
            for m in ac.find_iter(line) {
                let callee = &names[m.pattern().as_usize()];
                if callee == &caller.name || !is_call_at(line, m.start(), m.end()) || is_definition(line, callee) {
                    continue;
                }
                let homes = defined_in.get(callee.as_str());
                let callee_file = match homes {
                    Some(h) if h.contains(file.rel_path.as_str()) => Some(file.rel_path.clone()),
                    Some(h) if h.len() == 1 => h.iter().next().map(|f| f.to_string()),
                    _ => None,
                };
                edges.insert(CallEdge {
                    caller: caller.name.clone(),
                    caller_file: file.rel_path.clone(),
                    callee: callee.clone(),
                    callee_file,
                });
            }
        }
    }
    Ok(edges)
}

pub struct CallGraphAgent;

impl Agent for CallGraphAgent {
    fn name(&self) -> &'static str {
        AGENT
    }

    fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
        let mut out = AgentOutput::new(AGENT);
        let code: Vec<&SourceFile> = input.files.code().collect();
        out.coverage.files_total = code.len();
        let mut considered = Vec::with_capacity(code.len());
        for file in code {
            if !out.consider(input, file) {
                break;
            }
            considered.push(file);
        }

        let mut fan_out: HashMap<String, usize> = HashMap::new();
        for edge in call_edges(&considered)? {
            *fan_out.entry(edge.caller.clone()).or_default() += 1;
            let mut rel = FindingRelation::new(edge.caller, edge.callee, EdgeKind::Calls)
                .between_files(Some(edge.caller_file), edge.callee_file);
            rel.confidence = 0.8;
            out.relate(rel);
        }
        tracing::debug!(edges = out.relationships.len(), callers = fan_out.len(), "call graph built");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::input;

    #[test]
    fn definitions_are_not_call_sites() {
        assert!(is_definition("pub fn store_artifact(data: &Data) {", "store_artifact"));
        assert!(is_definition("def store_artifact(x):", "store_artifact"));
        assert!(!is_definition("    store_artifact(x - 1);", "store_artifact"));
    }

    #[test]
    fn word_boundary_and_call_shape() {
        let line = "let x = restore_artifact(a) + store_artifact(b);";
        let pos = line.find("store_artifact(b)").unwrap();
        assert!(is_call_at(line, pos, pos + "store_artifact".len()));
        let inner = line.find("store_artifact(a)").unwrap();
        assert!(!is_call_at(line, inner, inner + "store_artifact".len()));
        assert!(!is_call_at("let store_artifact = 1;", 4, 18));
    }

    #[test]
    fn edges_link_enclosing_caller_to_callee() {
        let cache = SourceFile::new(
            "src/cache.rs",
            "pub fn store_artifact(x: u32) {\n    write_blob(x);\n}\n\npub fn write_blob(x: u32) {\n}\n",
        );
        let api = SourceFile::new(
            "src/api.rs",
            "pub fn handle() {\n    cache::store_artifact(1);\n    helper();\n}\n\nfn helper() {\n    store_artifact(2);\n}\n",
        );
        let edges = call_edges(&[&cache, &api]).unwrap();
        let pairs: Vec<(&str, &str)> = edges.iter().map(|e| (e.caller.as_str(), e.callee.as_str())).collect();
        assert_eq!(pairs, vec![("handle", "store_artifact"), ("store_artifact", "write_blob")]);
        let first = edges.iter().next().unwrap();
        assert_eq!(first.caller_file, "src/api.rs");
        assert_eq!(first.callee_file.as_deref(), Some("src/cache.rs"));
    }

    #[test]
    fn callee_file_prefers_the_callers_own_file() {
        let api = SourceFile::new(
            "api/lib.rs",
            "pub fn parse() {\n}\n\npub fn handle() {\n    parse();\n}\n",
        );
        let web = SourceFile::new("web/lib.rs", "pub fn parse() {\n}\n");
        let cli = SourceFile::new("cli/main.rs", "pub fn run() {\n    parse();\n}\n");
        let edges = call_edges(&[&api, &web, &cli]).unwrap();
        let by_caller: HashMap<&str, Option<&str>> = edges
            .iter()
            .map(|e| (e.caller.as_str(), e.callee_file.as_deref()))
            .collect();
        assert_eq!(by_caller["handle"], Some("api/lib.rs"));
        assert_eq!(by_caller["run"], None);
    }

    #[test]
    fn agent_reports_calls_relationships() {
        let input = input(&[("app.py", "def main():\n    run_server()\n\ndef run_server():\n    pass\n")]);
        let out = CallGraphAgent.run(&input).unwrap();
        assert!(out.findings.is_empty());
        assert_eq!(out.relationships.len(), 1);
        assert_eq!(out.relationships[0].from_title, "main");
        assert_eq!(out.relationships[0].to_title, "run_server");
        assert_eq!(out.relationships[0].kind, EdgeKind::Calls);
        assert_eq!(out.relationships[0].from_file.as_deref(), Some("app.py"));
        assert_eq!(out.relationships[0].to_file.as_deref(), Some("app.py"));
        assert_eq!(out.coverage.files_analyzed, 1);
    }
}
