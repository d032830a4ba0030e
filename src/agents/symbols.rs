//! Regex symbol extraction for Rust, Python, TypeScript/JavaScript, Go and
//! Java. Only public symbols become findings; private ones are still
//! returned by [`extract`] because the call graph needs enclosing spans.

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

use super::{Agent, AgentInput, AgentOutput, Language, SourceFile};
use crate::memory::model::{EdgeKind, Finding, FindingRelation, FindingType, SymbolKind};

pub const AGENT: &str = "symbols";
const DOC_LIMIT: usize = 240;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub public: bool,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub doc_comment: String,
    /// Enclosing impl/class, when any.
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub symbols: Vec<ExtractedSymbol>,
    /// `(type, trait)` pairs from `impl Trait for Type`.
    pub implementations: Vec<(String, String)>,
}

lazy_static! {
    static ref RS_FN: Regex = Regex::new(
        r"^\s*(pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)\s*(<[^(]*>)?\s*\(([^)]*)\)?(?:\s*->\s*([^{;]+?))?\s*(?:\{|where|;|$)"
    )
    .unwrap();
    static ref RS_ITEM: Regex = Regex::new(
        r"^\s*(pub(?:\([^)]*\))?\s+)?(struct|enum|trait|type|mod|const|static)\s+([A-Za-z_][A-Za-z0-9_]*)"
    )
    .unwrap();
    static ref RS_IMPL: Regex = Regex::new(
        r"^\s*impl(?:<[^>]*>)?\s+(?:([A-Za-z_][A-Za-z0-9_:]*)(?:<[^>]*>)?\s+for\s+)?([A-Za-z_][A-Za-z0-9_]*)"
    )
    .unwrap();
    static ref PY_CLASS: Regex = Regex::new(r"^class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref PY_DEF: Regex = Regex::new(r"^(\s*)(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)?").unwrap();
    static ref PY_CONST: Regex = Regex::new(r"^([A-Z][A-Z0-9_]+)\s*(?::[^=]+)?=").unwrap();
    static ref JS_FN: Regex = Regex::new(
        r"^\s*(export\s+(?:default\s+)?)?(?:async\s+)?function\*?\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?:<[^(]*>)?\s*\(([^)]*)\)?"
    )
    .unwrap();
    static ref JS_ITEM: Regex = Regex::new(
        r"^\s*(export\s+(?:default\s+)?)?(?:declare\s+)?(?:abstract\s+)?(class|interface|type|enum)\s+([A-Za-z_$][A-Za-z0-9_$]*)"
    )
    .unwrap();
    static ref JS_CONST: Regex = Regex::new(
        r"^\s*(export\s+)?(const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(.*)$"
    )
    .unwrap();
    static ref GO_FUNC: Regex = Regex::new(
        r"^func\s+(?:\(\s*[A-Za-z_]*\s*\*?\s*([A-Za-z_][A-Za-z0-9_]*)[^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*(?:\[[^\]]*\])?\(([^)]*)\)?"
    )
    .unwrap();
    static ref GO_TYPE: Regex = Regex::new(r"^type\s+([A-Za-z_][A-Za-z0-9_]*)\s+(struct|interface)?").unwrap();
    static ref GO_VALUE: Regex = Regex::new(r"^(const|var)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref GO_PACKAGE: Regex = Regex::new(r"^package\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref JAVA_TYPE: Regex = Regex::new(
        r"^\s*(public\s+)?(?:abstract\s+|final\s+|static\s+)*(class|interface|enum|record)\s+([A-Za-z_][A-Za-z0-9_]*)"
    )
    .unwrap();
    static ref JAVA_METHOD: Regex = Regex::new(
        r"^\s+(public\s+)(?:static\s+|final\s+|synchronized\s+|abstract\s+)*[A-Za-z_][A-Za-z0-9_<>\[\],\s]*\s+([a-z][A-Za-z0-9_]*)\s*\(([^)]*)\)?"
    )
    .unwrap();
}

fn sym(name: &str, kind: SymbolKind, public: bool, line: usize, signature: String) -> ExtractedSymbol {
    ExtractedSymbol {
        name: name.to_string(),
        kind,
        public,
        start_line: line as u32,
        end_line: line as u32,
        signature,
        doc_comment: String::new(),
        parent: None,
    }
}

fn brace_delta(line: &str) -> i32 {
    line.chars().fold(0, |d, ch| match ch {
        '{' => d + 1,
        '}' => d - 1,
        _ => d,
    })
}

// ── Rust ────────────────────────────────────────────────────────────────────

fn extract_rust(lines: &[&str], out: &mut Extraction) {
    let mut current_impl: Option<(String, bool)> = None;
    let mut impl_depth = 0i32;

    for (idx, line) in lines.iter().enumerate() {
        let line_num = idx + 1;
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            continue;
        }

        if let Some(caps) = RS_IMPL.captures(line) {
            let ty = caps[2].to_string();
            let is_trait_impl = caps.get(1).is_some();
            if let Some(tr) = caps.get(1) {
                let tr = tr.as_str().rsplit("::").next().unwrap_or_default().to_string();
                out.implementations.push((ty.clone(), tr));
            }
            current_impl = Some((ty, is_trait_impl));
            impl_depth = brace_delta(line);
            continue;
        }

        if current_impl.is_some() {
            impl_depth += brace_delta(line);
            if impl_depth <= 0 && line.contains('}') {
                current_impl = None;
                continue;
            }
        }

        if let Some(caps) = RS_FN.captures(line) {
            let params = caps.get(4).map(|m| m.as_str().trim()).unwrap_or_default();
            let generics = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            let signature = match caps.get(5) {
                Some(r) => format!("fn {}{generics}({params}) -> {}", &caps[2], r.as_str().trim()),
                None => format!("fn {}{generics}({params})", &caps[2]),
            };
            let declared = is_plain_pub(caps.get(1).map(|m| m.as_str()));
            // methods of trait impls are as visible as the trait
            let (kind, public, parent) = match &current_impl {
                Some((ty, trait_impl)) => (SymbolKind::Method, declared || *trait_impl, Some(ty.clone())),
                None => (SymbolKind::Function, declared, None),
            };
            let mut s = sym(&caps[2], kind, public, line_num, signature);
            s.parent = parent;
            out.symbols.push(s);
            continue;
        }

        if current_impl.is_some() {
            continue;
        }

        if let Some(caps) = RS_ITEM.captures(line) {
            let kind = match &caps[2] {
                "struct" => SymbolKind::Struct,
                "enum" | "type" => SymbolKind::Type,
                "trait" => SymbolKind::Interface,
                "mod" => SymbolKind::Module,
                _ => SymbolKind::Constant,
            };
            let public = is_plain_pub(caps.get(1).map(|m| m.as_str()));
            let signature = trimmed.trim_end_matches('{').trim().to_string();
            out.symbols.push(sym(&caps[3], kind, public, line_num, signature));
        }
    }
}

/// `pub` and `pub(crate)` count; `pub(super)`/`pub(in ..)` do not.
fn is_plain_pub(vis: Option<&str>) -> bool {
    matches!(vis.map(str::trim), Some("pub") | Some("pub(crate)"))
}

// ── Python ──────────────────────────────────────────────────────────────────

fn extract_python(lines: &[&str], out: &mut Extraction) {
    let mut current_class: Option<String> = None;
    for (idx, line) in lines.iter().enumerate() {
        let line_num = idx + 1;
        if let Some(caps) = PY_CLASS.captures(line) {
            let name = caps[1].to_string();
            current_class = Some(name.clone());
            out.symbols.push(sym(&name, SymbolKind::Struct, !name.starts_with('_'), line_num, line.trim().trim_end_matches(':').to_string()));
            continue;
        }
        if let Some(caps) = PY_DEF.captures(line) {
            let indent = caps[1].len();
            let name = caps[2].to_string();
            let params = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
            let signature = format!("def {name}({params})");
            let s = if indent > 0 && current_class.is_some() {
                let public = !name.starts_with('_') || (name.starts_with("__") && name.ends_with("__"));
                let mut s = sym(&name, SymbolKind::Method, public, line_num, signature);
                s.parent = current_class.clone();
                s
            } else if indent == 0 {
                current_class = None;
                sym(&name, SymbolKind::Function, !name.starts_with('_'), line_num, signature)
            } else {
                continue;
            };
            out.symbols.push(s);
            continue;
        }
        if let Some(caps) = PY_CONST.captures(line) {
            current_class = None;
            out.symbols.push(sym(&caps[1], SymbolKind::Constant, true, line_num, line.trim().to_string()));
        }
    }
}

// ── TypeScript / JavaScript ─────────────────────────────────────────────────

fn extract_js(lines: &[&str], out: &mut Extraction) {
    for (idx, line) in lines.iter().enumerate() {
        let line_num = idx + 1;
        if let Some(caps) = JS_FN.captures(line) {
            let params = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
            out.symbols.push(sym(&caps[2], SymbolKind::Function, caps.get(1).is_some(), line_num, format!("function {}({params})", &caps[2])));
            continue;
        }
        if let Some(caps) = JS_ITEM.captures(line) {
            let kind = match &caps[2] {
                "class" => SymbolKind::Struct,
                "interface" => SymbolKind::Interface,
                _ => SymbolKind::Type,
            };
            let signature = line.trim().trim_end_matches('{').trim().to_string();
            out.symbols.push(sym(&caps[3], kind, caps.get(1).is_some(), line_num, signature));
            continue;
        }
        if let Some(caps) = JS_CONST.captures(line) {
            if line.starts_with(char::is_whitespace) {
                continue;
            }
            let rhs = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
            let kind = if rhs.contains("=>") || rhs.starts_with("function") || rhs.starts_with("async") {
                SymbolKind::Function
            } else if &caps[2] == "const" {
                SymbolKind::Constant
            } else {
                SymbolKind::Variable
            };
            let signature = line.trim().trim_end_matches('{').trim().to_string();
            out.symbols.push(sym(&caps[3], kind, caps.get(1).is_some(), line_num, signature));
        }
    }
}

// ── Go ──────────────────────────────────────────────────────────────────────

fn go_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn extract_go(lines: &[&str], out: &mut Extraction) {
    for (idx, line) in lines.iter().enumerate() {
        let line_num = idx + 1;
        if let Some(caps) = GO_PACKAGE.captures(line) {
            out.symbols.push(sym(&caps[1], SymbolKind::Package, false, line_num, line.trim().to_string()));
            continue;
        }
        if let Some(caps) = GO_FUNC.captures(line) {
            let name = caps[2].to_string();
            let params = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
            let mut s = match caps.get(1) {
                Some(recv) => {
                    let mut s = sym(&name, SymbolKind::Method, go_exported(&name), line_num, format!("func ({}) {name}({params})", recv.as_str()));
                    s.parent = Some(recv.as_str().to_string());
                    s
                }
                None => sym(&name, SymbolKind::Function, go_exported(&name), line_num, format!("func {name}({params})")),
            };
            s.signature = s.signature.trim().to_string();
            out.symbols.push(s);
            continue;
        }
        if let Some(caps) = GO_TYPE.captures(line) {
            let kind = match caps.get(2).map(|m| m.as_str()) {
                Some("struct") => SymbolKind::Struct,
                Some("interface") => SymbolKind::Interface,
                _ => SymbolKind::Type,
            };
            out.symbols.push(sym(&caps[1], kind, go_exported(&caps[1]), line_num, line.trim().trim_end_matches('{').trim().to_string()));
            continue;
        }
        if let Some(caps) = GO_VALUE.captures(line) {
            let kind = if &caps[1] == "const" {
                SymbolKind::Constant
            } else {
                SymbolKind::Variable
            };
            out.symbols.push(sym(&caps[2], kind, go_exported(&caps[2]), line_num, line.trim().to_string()));
        }
    }
}

// ── Java ────────────────────────────────────────────────────────────────────

fn extract_java(lines: &[&str], out: &mut Extraction) {
    let mut current_type: Option<String> = None;
    for (idx, line) in lines.iter().enumerate() {
        let line_num = idx + 1;
        if let Some(caps) = JAVA_TYPE.captures(line) {
            let kind = match &caps[2] {
                "interface" => SymbolKind::Interface,
                "enum" => SymbolKind::Type,
                _ => SymbolKind::Struct,
            };
            current_type = Some(caps[3].to_string());
            out.symbols.push(sym(&caps[3], kind, caps.get(1).is_some(), line_num, line.trim().trim_end_matches('{').trim().to_string()));
            continue;
        }
        if let Some(caps) = JAVA_METHOD.captures(line) {
            if line.contains(" new ") || line.trim_end().ends_with(';') && !line.contains("abstract") {
                continue;
            }
            let params = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
            let mut s = sym(&caps[2], SymbolKind::Method, true, line_num, format!("{}({params})", &caps[2]));
            s.parent = current_type.clone();
            out.symbols.push(s);
        }
    }
}

// ── Spans and doc comments ──────────────────────────────────────────────────

fn compute_spans(lines: &[&str], symbols: &mut [ExtractedSymbol], lang: Language) {
    match lang {
        Language::Python => compute_spans_indent(lines, symbols),
        _ => compute_spans_braces(lines, symbols),
    }
}

/// Closing brace that balances the first opening one at or after the start.
fn compute_spans_braces(lines: &[&str], symbols: &mut [ExtractedSymbol]) {
    for s in symbols.iter_mut() {
        let start = s.start_line.saturating_sub(1) as usize;
        let mut depth = 0i32;
        let mut opened = false;
        for (i, line) in lines.iter().enumerate().skip(start) {
            if !opened && i > start && line.trim_end().ends_with(';') && !line.contains('{') {
                break;
            }
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if opened && depth <= 0 {
                s.end_line = (i + 1) as u32;
                break;
            }
            if !opened && line.trim_end().ends_with(';') {
                break;
            }
        }
    }
}

fn compute_spans_indent(lines: &[&str], symbols: &mut [ExtractedSymbol]) {
    for s in symbols.iter_mut() {
        let start = s.start_line.saturating_sub(1) as usize;
        let Some(first) = lines.get(start) else { continue };
        let base = first.len() - first.trim_start().len();
        let mut last = s.start_line;
        for (i, line) in lines.iter().enumerate().skip(start + 1) {
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            if line.len() - trimmed.len() <= base {
                break;
            }
            last = (i + 1) as u32;
        }
        s.end_line = last;
    }
}

fn strip_comment(line: &str) -> Option<&str> {
    let t = line.trim();
    for prefix in ["///", "//!", "//", "/**", "*/", "*", "#"] {
        if let Some(rest) = t.strip_prefix(prefix) {
            if prefix == "#" && t.starts_with("#[") {
                return None;
            }
            return Some(rest.trim_end_matches("*/").trim());
        }
    }
    None
}

fn doc_above(lines: &[&str], start_line: u32) -> String {
    let mut parts = Vec::new();
    let mut i = start_line.saturating_sub(1) as usize;
    while i > 0 {
        i -= 1;
        let t = lines[i].trim();
        // attributes and decorators sit between docs and the item
        if t.starts_with("#[") || t.starts_with('@') {
            continue;
        }
        match strip_comment(t) {
            Some(text) => parts.push(text),
            None => break,
        }
    }
    parts.reverse();
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

fn python_docstring(lines: &[&str], start_line: u32) -> String {
    let Some(next) = lines.get(start_line as usize) else {
        return String::new();
    };
    let t = next.trim();
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = t.strip_prefix(quote) {
            return rest.split(quote).next().unwrap_or_default().trim().to_string();
        }
    }
    String::new()
}

fn truncate(mut s: String) -> String {
    if s.chars().count() > DOC_LIMIT {
        s = s.chars().take(DOC_LIMIT).collect::<String>() + "...";
    }
    s
}

/// All symbols in `file`, private ones included.
pub fn extract(file: &SourceFile) -> Extraction {
    let lines: Vec<&str> = file.content.lines().collect();
    let mut out = Extraction::default();
    match file.language {
        Language::Rust => extract_rust(&lines, &mut out),
        Language::Python => extract_python(&lines, &mut out),
        Language::TypeScript | Language::JavaScript => extract_js(&lines, &mut out),
        Language::Go => extract_go(&lines, &mut out),
        Language::Java => extract_java(&lines, &mut out),
        Language::Markdown | Language::Other => return out,
    }
    compute_spans(&lines, &mut out.symbols, file.language);
    for s in out.symbols.iter_mut() {
        let doc = if file.language == Language::Python {
            python_docstring(&lines, s.start_line)
        } else {
            doc_above(&lines, s.start_line)
        };
        s.doc_comment = truncate(doc);
    }
    out
}

/// `crate::a::b` style path for Rust, dotted for Python, the file stem path
/// for everything else.
pub fn module_path(file: &SourceFile) -> String {
    let path = file.rel_path.as_str();
    let stem = path.rsplit_once('.').map(|(s, _)| s).unwrap_or(path);
    match file.language {
        Language::Rust => {
            let inner = stem.split_once("src/").map(|(_, r)| r).unwrap_or(stem);
            let parts: Vec<&str> = inner
                .split('/')
                .filter(|p| !matches!(*p, "lib" | "main" | "mod"))
                .collect();
            if parts.is_empty() {
                "crate".to_string()
            } else {
                format!("crate::{}", parts.join("::"))
            }
        }
        Language::Python => stem.trim_end_matches("/__init__").replace('/', "."),
        _ => stem.to_string(),
    }
}

pub struct SymbolAgent;

impl Agent for SymbolAgent {
    fn name(&self) -> &'static str {
        AGENT
    }

    fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
        let mut out = AgentOutput::new(AGENT);
        out.coverage.files_total = input.files.code().count();
        for file in input.files.code() {
            if !out.consider(input, file) {
                break;
            }
            let extraction = extract(file);
            let module = module_path(file);
            let public: Vec<&ExtractedSymbol> = extraction.symbols.iter().filter(|s| s.public).collect();
            for s in &public {
                let body = if s.doc_comment.is_empty() {
                    s.signature.clone()
                } else {
                    format!("{}\n{}", s.doc_comment, s.signature)
                };
                let finding = Finding::new(AGENT, FindingType::Symbol, s.name.as_str())
                    .with_body(body)
                    .with_meta("kind", s.kind.as_str())
                    .with_meta("file_path", file.rel_path.as_str())
                    .with_meta("start_line", s.start_line.to_string())
                    .with_meta("end_line", s.end_line.to_string())
                    .with_meta("signature", s.signature.as_str())
                    .with_meta("doc_comment", s.doc_comment.as_str())
                    .with_meta("module_path", module.as_str())
                    .with_evidence(file.evidence(s.start_line, s.end_line));
                out.push(input, finding);
            }
            for (ty, tr) in &extraction.implementations {
                if public.iter().any(|s| &s.name == ty) {
                    out.relate(FindingRelation::new(ty.as_str(), tr.as_str(), EdgeKind::Implements));
                }
            }
        }
        Ok(out)
    }
}
