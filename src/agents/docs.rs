//! Project documentation: the README proposes the workspace overview and
//! architecture decision records become Decisions.

use anyhow::Result;

use super::{Agent, AgentInput, AgentOutput, ProposedOverview, SourceFile};
use crate::memory::model::{Finding, FindingType};

pub const AGENT: &str = "docs";
const ADR_DIRS: &[&str] = &["docs/adr/", "doc/adr/", "docs/decisions/", "adr/", "docs/architecture/decisions/"];
const LONG_LIMIT: usize = 1200;

fn is_readme(f: &SourceFile) -> bool {
    !f.rel_path.contains('/') && f.file_name().to_ascii_lowercase().starts_with("readme")
}

fn is_adr(f: &SourceFile) -> bool {
    f.rel_path.ends_with(".md")
        && ADR_DIRS.iter().any(|d| f.rel_path.starts_with(d))
        && !f.file_name().eq_ignore_ascii_case("readme.md")
        && !f.file_name().to_ascii_lowercase().starts_with("template")
}

/// Paragraphs of prose: headings, badges, html and code fences removed.
fn paragraphs(markdown: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;
    for line in markdown.lines() {
        let t = line.trim();
        if t.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        let skip = in_fence || t.starts_with('#') || t.starts_with("![") || t.starts_with("[![") || t.starts_with('<');
        if t.is_empty() || skip {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
            continue;
        }
        current.push(t);
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

fn first_sentence(text: &str) -> String {
    let end = text
        .char_indices()
        .find(|(i, c)| *c == '.' && text[i + 1..].starts_with([' ', '\n']) || *c == '.' && i + 1 == text.len())
        .map(|(i, _)| i + 1)
        .unwrap_or(text.len());
    text[..end].trim().to_string()
}

pub fn readme_overview(markdown: &str) -> Option<ProposedOverview> {
    let paras = paragraphs(markdown);
    let first = paras.first()?;
    let mut long = String::new();
    for p in &paras {
        if !long.is_empty() && long.len() + p.len() + 2 > LONG_LIMIT {
            break;
        }
        if !long.is_empty() {
            long.push_str("\n\n");
        }
        long.push_str(p);
    }
    Some(ProposedOverview {
        short: first_sentence(first),
        long,
    })
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Adr {
    pub title: String,
    pub status: String,
    pub context: String,
    pub decision: String,
    pub consequences: String,
}

/// Drops `ADR-007:`, `0007.` and `7 -` style prefixes from an ADR title.
fn clean_title(raw: &str) -> String {
    let mut t = raw.trim();
    if t.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("adr-")) {
        t = &t[4..];
    }
    let t = t.trim_start_matches(|c: char| c.is_ascii_digit());
    t.trim_start_matches(|c: char| matches!(c, '.' | ':' | '-' | ' '))
        .trim()
        .to_string()
}

pub fn parse_adr(markdown: &str) -> Option<Adr> {
    let mut adr = Adr::default();
    let mut section = String::new();
    for line in markdown.lines() {
        let t = line.trim();
        if let Some(h) = t.strip_prefix("# ") {
            if adr.title.is_empty() {
                adr.title = clean_title(h);
            }
            continue;
        }
        if let Some(h) = t.strip_prefix("## ") {
            section = h.trim().to_ascii_lowercase();
            continue;
        }
        if t.is_empty() {
            continue;
        }
        let target = match section.as_str() {
            "status" => &mut adr.status,
            "context" | "context and problem statement" => &mut adr.context,
            "decision" | "decision outcome" => &mut adr.decision,
            "consequences" => &mut adr.consequences,
            _ => continue,
        };
        if !target.is_empty() {
            target.push(' ');
        }
        target.push_str(t.trim_start_matches(['-', '*', ' ']));
    }
    (!adr.title.is_empty() && !adr.decision.is_empty()).then_some(adr)
}

fn is_inactive(status: &str) -> bool {
    let s = status.to_ascii_lowercase();
    ["superseded", "rejected", "deprecated"].iter().any(|w| s.contains(w))
}

pub struct DocsAgent;

impl Agent for DocsAgent {
    fn name(&self) -> &'static str {
        AGENT
    }

    fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
        let mut out = AgentOutput::new(AGENT);
        let docs: Vec<&SourceFile> = input.files.files.iter().filter(|f| is_readme(f) || is_adr(f)).collect();
        out.coverage.files_total = docs.len();

        for file in docs {
            if !out.consider(input, file) {
                break;
            }
            if is_readme(file) {
                if out.overview.is_none() {
                    out.overview = readme_overview(&file.content);
                }
                continue;
            }
            let Some(adr) = parse_adr(&file.content) else { continue };
            if is_inactive(&adr.status) {
                continue;
            }
            let lines = file.content.lines().count().max(1) as u32;
            let mut finding = Finding::new(AGENT, FindingType::Decision, adr.title.as_str())
                .with_body(adr.decision.as_str())
                .with_meta("summary", first_sentence(&adr.decision))
                .with_meta("reasoning", adr.context.as_str())
                .with_meta("tradeoffs", adr.consequences.as_str())
                .with_evidence(file.evidence(1, lines));
            if adr.status.to_ascii_lowercase().contains("proposed") {
                finding = finding.with_confidence(0.6);
            }
            out.push(input, finding);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::input;

    const ADR: &str = "\
# ADR-003: Use JWT for sessions

## Status

Accepted

## Context

Sessions must survive restarts without a shared store.

## Decision

Issue signed JWTs. Refresh tokens live in an httpOnly cookie.

## Consequences

- Revocation needs a deny list.
";

    #[test]
    fn adr_sections_are_parsed() {
        let adr = parse_adr(ADR).unwrap();
        assert_eq!(adr.title, "Use JWT for sessions");
        assert_eq!(adr.status, "Accepted");
        assert_eq!(adr.context, "Sessions must survive restarts without a shared store.");
        assert_eq!(first_sentence(&adr.decision), "Issue signed JWTs.");
        assert_eq!(adr.consequences, "Revocation needs a deny list.");
        assert_eq!(clean_title("0007. Adopt SQLite"), "Adopt SQLite");
    }

    #[test]
    fn readme_overview_skips_badges_and_code() {
        let readme = "# TaskWing\n\n[![ci](x)](y)\n\nLocal project memory. Works offline.\n\n```sh\ncargo install\n```\n\nSecond paragraph.\n";
        let o = readme_overview(readme).unwrap();
        assert_eq!(o.short, "Local project memory.");
        assert_eq!(o.long, "Local project memory. Works offline.\n\nSecond paragraph.");
    }

    #[test]
    fn agent_reads_readme_and_active_adrs() {
        let superseded = "# 2. Use sessions\n\n## Status\n\nSuperseded by ADR-003\n\n## Decision\n\nServer sessions.\n";
        let input = input(&[
            ("README.md", "# App\n\nA billing service.\n"),
            ("docs/adr/0002-sessions.md", superseded),
            ("docs/adr/0003-jwt.md", ADR),
            ("docs/guide.md", "# Guide\n"),
        ]);
        let out = DocsAgent.run(&input).unwrap();
        assert_eq!(out.coverage.files_total, 3);
        assert_eq!(out.overview.as_ref().unwrap().short, "A billing service.");
        assert_eq!(out.findings.len(), 1);
        let d = &out.findings[0];
        assert_eq!(d.title, "Use JWT for sessions");
        assert_eq!(d.meta("reasoning"), Some("Sessions must survive restarts without a shared store."));
        assert_eq!(d.evidence[0].end_line, Some(ADR.lines().count() as u32));
    }
}
