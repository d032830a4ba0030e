//! Project conventions: test layout, CI, error and logging idioms, lint and
//! format configuration, and the license.

use anyhow::Result;
use std::collections::BTreeMap;

use super::{Agent, AgentInput, AgentOutput, Language, SourceFile};
use crate::memory::model::{EvidenceRef, Finding, FindingType};

pub const AGENT: &str = "conventions";

#[derive(Debug, Clone, Copy)]
enum Signal {
    PathPrefix(&'static str),
    PathSuffix(&'static str),
    FileName(&'static str),
    Contains(Language, &'static str),
}

struct Rule {
    kind: FindingType,
    title: &'static str,
    body: &'static str,
    signal: Signal,
}

const RULES: &[Rule] = &[
    Rule {
        kind: FindingType::Pattern,
        title: "Integration tests in tests/",
        body: "Integration tests live in a top-level tests/ directory and drive the public API.",
        signal: Signal::PathPrefix("tests/"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Inline unit test modules",
        body: "Unit tests sit next to the code in #[cfg(test)] modules.",
        signal: Signal::Contains(Language::Rust, "#[cfg(test)]"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Colocated .test files",
        body: "JavaScript and TypeScript tests sit beside their modules as *.test files.",
        signal: Signal::PathSuffix(".test.ts"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Colocated .test files",
        body: "JavaScript and TypeScript tests sit beside their modules as *.test files.",
        signal: Signal::PathSuffix(".test.js"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "pytest test modules",
        body: "Python tests are test_*.py modules collected by pytest.",
        signal: Signal::Contains(Language::Python, "def test_"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Errors carry anyhow context",
        body: "Fallible functions return anyhow::Result and add context at I/O boundaries.",
        signal: Signal::Contains(Language::Rust, ".context("),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Typed errors with thiserror",
        body: "Domain errors are enums deriving thiserror::Error.",
        signal: Signal::Contains(Language::Rust, "#[derive(Debug, Error)]"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Logging through tracing",
        body: "Diagnostics go through the tracing macros rather than println.",
        signal: Signal::Contains(Language::Rust, "tracing::"),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Module-level Python loggers",
        body: "Each module takes a logger from logging.getLogger(__name__).",
        signal: Signal::Contains(Language::Python, "logging.getLogger("),
    },
    Rule {
        kind: FindingType::Pattern,
        title: "Errors wrapped with %w",
        body: "Go errors are wrapped with fmt.Errorf and %w to keep the chain.",
        signal: Signal::Contains(Language::Go, "%w"),
    },
    Rule {
        kind: FindingType::Constraint,
        title: "CI on GitHub Actions",
        body: "Changes must pass the GitHub Actions workflows.",
        signal: Signal::PathPrefix(".github/workflows/"),
    },
    Rule {
        kind: FindingType::Constraint,
        title: "CI on GitLab",
        body: "Changes must pass the GitLab CI pipeline.",
        signal: Signal::FileName(".gitlab-ci.yml"),
    },
    Rule {
        kind: FindingType::Constraint,
        title: "Formatting enforced by rustfmt",
        body: "Rust sources follow the repository rustfmt configuration.",
        signal: Signal::FileName("rustfmt.toml"),
    },
    Rule {
        kind: FindingType::Constraint,
        title: "Formatting enforced by Prettier",
        body: "Web sources follow the repository Prettier configuration.",
        signal: Signal::FileName(".prettierrc"),
    },
    Rule {
        kind: FindingType::Constraint,
        title: "Editor settings in .editorconfig",
        body: "Indentation and line endings follow .editorconfig.",
        signal: Signal::FileName(".editorconfig"),
    },
];

fn signal_line(signal: Signal, file: &SourceFile) -> Option<u32> {
    match signal {
        Signal::PathPrefix(p) => file.rel_path.starts_with(p).then_some(1),
        Signal::PathSuffix(s) => file.rel_path.ends_with(s).then_some(1),
        Signal::FileName(n) => (file.rel_path == n).then_some(1),
        Signal::Contains(lang, needle) if file.language == lang => file
            .content
            .lines()
            .position(|l| l.contains(needle))
            .map(|i| i as u32 + 1),
        Signal::Contains(..) => None,
    }
}

/// SPDX-ish name from the first lines of a license file.
pub fn license_name(content: &str) -> Option<&'static str> {
    let head: String = content.lines().take(5).collect::<Vec<_>>().join(" ").to_ascii_lowercase();
    [
        ("mit license", "MIT"),
        ("apache license", "Apache-2.0"),
        ("gnu general public license", "GPL"),
        ("gnu lesser general public license", "LGPL"),
        ("mozilla public license", "MPL-2.0"),
        ("bsd 3-clause", "BSD-3-Clause"),
        ("bsd 2-clause", "BSD-2-Clause"),
    ]
    .iter()
    .find(|(needle, _)| head.contains(needle))
    .map(|(_, name)| *name)
}

struct Hit {
    kind: FindingType,
    body: &'static str,
    evidence: EvidenceRef,
    files: usize,
}

pub struct ConventionsAgent;

impl Agent for ConventionsAgent {
    fn name(&self) -> &'static str {
        AGENT
    }

    fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
        let mut out = AgentOutput::new(AGENT);
        out.coverage.files_total = input.files.files.len();
        let mut hits: BTreeMap<&'static str, Hit> = BTreeMap::new();
        let mut license: Option<(&'static str, EvidenceRef)> = None;

        for file in &input.files.files {
            if !out.consider(input, file) {
                break;
            }
            for rule in RULES {
                let Some(line) = signal_line(rule.signal, file) else { continue };
                hits.entry(rule.title)
                    .and_modify(|h| h.files += 1)
                    .or_insert_with(|| Hit {
                        kind: rule.kind,
                        body: rule.body,
                        evidence: file.evidence(line, line),
                        files: 1,
                    });
            }
            let upper = file.file_name().to_ascii_uppercase();
            if license.is_none() && !file.rel_path.contains('/') && (upper.starts_with("LICENSE") || upper.starts_with("LICENCE")) {
                license = license_name(&file.content).map(|n| (n, file.evidence(1, 1)));
            }
        }

        for (title, hit) in hits {
            let body = if hit.files > 1 {
                format!("{} Seen in {} files.", hit.body, hit.files)
            } else {
                hit.body.to_string()
            };
            let confidence = if hit.files > 1 { 0.9 } else { 0.7 };
            out.push(
                input,
                Finding::new(AGENT, hit.kind, title)
                    .with_body(body)
                    .with_evidence(hit.evidence)
                    .with_confidence(confidence),
            );
        }
        if let Some((name, evidence)) = license {
            out.push(
                input,
                Finding::new(AGENT, FindingType::Constraint, format!("Licensed under {name}"))
                    .with_body(format!("Contributions are distributed under the {name} license."))
                    .with_evidence(evidence),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::input;

    #[test]
    fn license_detection() {
        assert_eq!(license_name("MIT License\n\nCopyright (c) 2024"), Some("MIT"));
        assert_eq!(license_name("                                 Apache License\n Version 2.0"), Some("Apache-2.0"));
        assert_eq!(license_name("all rights reserved"), None);
    }

    #[test]
    fn conventions_are_found_once_with_counts() {
        let input = input(&[
            (".github/workflows/ci.yml", "on: push\n"),
            ("LICENSE", "MIT License\n"),
            ("src/a.rs", "fn a() {}\n#[cfg(test)]\nmod tests {}\n"),
            ("src/b.rs", "#[cfg(test)]\nmod tests {}\n"),
            ("tests/cli.rs", "#[test]\nfn t() {}\n"),
        ]);
        let out = ConventionsAgent.run(&input).unwrap();
        let titles: Vec<_> = out.findings.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "CI on GitHub Actions",
                "Inline unit test modules",
                "Integration tests in tests/",
                "Licensed under MIT",
            ]
        );
        let inline = &out.findings[1];
        assert_eq!(inline.finding_type, FindingType::Pattern);
        assert!(inline.body.ends_with("Seen in 2 files."));
        assert_eq!(inline.evidence[0].file_path, "src/a.rs");
        assert_eq!(inline.evidence[0].start_line, Some(2));
        assert_eq!(out.coverage.files_analyzed, 5);
    }
}
