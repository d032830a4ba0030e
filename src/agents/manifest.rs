//! Package manifests: the package itself becomes a Feature, well-known
//! framework dependencies become Decisions and toolchain pins become
//! Constraints.

use anyhow::Result;

use super::{Agent, AgentInput, AgentOutput, SourceFile};
use crate::memory::model::{Finding, FindingType};

pub const AGENT: &str = "manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Runtime,
    Dev,
    Build,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepEntry {
    pub name: String,
    pub version: String,
    pub kind: DepKind,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    pub file: String,
    pub ecosystem: &'static str,
    pub name: Option<String>,
    pub description: Option<String>,
    pub deps: Vec<DepEntry>,
    /// `(label, value)` pins such as `("Rust edition", "2021")`.
    pub toolchain: Vec<(String, String)>,
}

/// `(dependency, label, what it is for)`.
const FRAMEWORKS: &[(&str, &str, &str)] = &[
    ("tokio", "Tokio", "async runtime"),
    ("axum", "Axum", "HTTP server framework"),
    ("actix-web", "Actix Web", "HTTP server framework"),
    ("warp", "Warp", "HTTP server framework"),
    ("rocket", "Rocket", "HTTP server framework"),
    ("serde", "Serde", "serialization"),
    ("clap", "clap", "command-line parsing"),
    ("rusqlite", "SQLite via rusqlite", "embedded database"),
    ("sqlx", "SQLx", "async SQL access"),
    ("diesel", "Diesel", "ORM"),
    ("reqwest", "reqwest", "HTTP client"),
    ("tracing", "tracing", "structured logging"),
    ("anyhow", "anyhow", "error handling"),
    ("thiserror", "thiserror", "typed errors"),
    ("rayon", "Rayon", "data parallelism"),
    ("react", "React", "UI library"),
    ("next", "Next.js", "web framework"),
    ("vue", "Vue", "UI framework"),
    ("express", "Express", "HTTP server framework"),
    ("fastify", "Fastify", "HTTP server framework"),
    ("@nestjs/core", "NestJS", "server framework"),
    ("prisma", "Prisma", "ORM"),
    ("@prisma/client", "Prisma", "ORM"),
    ("typeorm", "TypeORM", "ORM"),
    ("jsonwebtoken", "JWT", "token authentication"),
    ("jest", "Jest", "test runner"),
    ("vitest", "Vitest", "test runner"),
    ("typescript", "TypeScript", "typed JavaScript"),
    ("django", "Django", "web framework"),
    ("flask", "Flask", "web framework"),
    ("fastapi", "FastAPI", "web framework"),
    ("sqlalchemy", "SQLAlchemy", "ORM"),
    ("pydantic", "Pydantic", "data validation"),
    ("pytest", "pytest", "test runner"),
    ("celery", "Celery", "task queue"),
    ("github.com/gin-gonic/gin", "Gin", "HTTP server framework"),
    ("github.com/labstack/echo/v4", "Echo", "HTTP server framework"),
    ("gorm.io/gorm", "GORM", "ORM"),
    ("github.com/spf13/cobra", "Cobra", "command-line parsing"),
    ("google.golang.org/grpc", "gRPC", "RPC framework"),
    ("github.com/golang-jwt/jwt/v5", "JWT", "token authentication"),
];

// ── Parsers ─────────────────────────────────────────────────────────────────

fn toml_deps(table: Option<&toml::Value>, kind: DepKind) -> Vec<DepEntry> {
    table
        .and_then(|d| d.as_table())
        .map(|t| {
            t.iter()
                .map(|(name, val)| {
                    let version = match val {
                        toml::Value::String(v) => v.clone(),
                        toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()).unwrap_or("*").to_string(),
                        _ => "*".to_string(),
                    };
                    DepEntry {
                        name: name.clone(),
                        version,
                        kind,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_cargo_toml(content: &str) -> Option<Manifest> {
    let table: toml::Value = toml::from_str(content).ok()?;
    let package = table.get("package");
    let text = |key: &str| package.and_then(|p| p.get(key)).and_then(|v| v.as_str()).map(str::to_string);
    let mut deps = toml_deps(table.get("dependencies"), DepKind::Runtime);
    deps.extend(toml_deps(table.get("dev-dependencies"), DepKind::Dev));
    deps.extend(toml_deps(table.get("build-dependencies"), DepKind::Build));
    let mut toolchain = Vec::new();
    if let Some(edition) = text("edition") {
        toolchain.push(("Rust edition".to_string(), edition));
    }
    if let Some(msrv) = text("rust-version") {
        toolchain.push(("Minimum Rust version".to_string(), msrv));
    }
    Some(Manifest {
        file: "Cargo.toml".into(),
        ecosystem: "rust",
        name: text("name"),
        description: text("description"),
        deps,
        toolchain,
    })
}

pub fn parse_package_json(content: &str) -> Option<Manifest> {
    let json: serde_json::Value = serde_json::from_str(content).ok()?;
    let deps_of = |key: &str, kind: DepKind| -> Vec<DepEntry> {
        json.get(key)
            .and_then(|d| d.as_object())
            .map(|m| {
                m.iter()
                    .map(|(name, ver)| DepEntry {
                        name: name.clone(),
                        version: ver.as_str().unwrap_or("*").to_string(),
                        kind,
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    let text = |key: &str| json.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let mut deps = deps_of("dependencies", DepKind::Runtime);
    deps.extend(deps_of("devDependencies", DepKind::Dev));
    let mut toolchain = Vec::new();
    if let Some(node) = json.get("engines").and_then(|e| e.get("node")).and_then(|v| v.as_str()) {
        toolchain.push(("Node.js".to_string(), node.to_string()));
    }
    Some(Manifest {
        file: "package.json".into(),
        ecosystem: "node",
        name: text("name"),
        description: text("description"),
        deps,
        toolchain,
    })
}

/// Split a PEP 508 specifier such as `requests>=2.28` into name and constraint.
pub fn split_pep508(spec: &str) -> (&str, &str) {
    let operators = [">=", "<=", "==", "!=", "~=", ">", "<", "[", ";"];
    match operators.iter().filter_map(|op| spec.find(op)).min() {
        Some(i) => (spec[..i].trim(), spec[i..].trim()),
        None => (spec.trim(), "*"),
    }
}

pub fn parse_pyproject_toml(content: &str) -> Option<Manifest> {
    let table: toml::Value = toml::from_str(content).ok()?;
    let project = table.get("project");
    let text = |key: &str| project.and_then(|p| p.get(key)).and_then(|v| v.as_str()).map(str::to_string);
    let deps = project
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| {
                    let (name, version) = split_pep508(s);
                    DepEntry {
                        name: name.to_lowercase(),
                        version: version.to_string(),
                        kind: DepKind::Runtime,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let mut toolchain = Vec::new();
    if let Some(py) = text("requires-python") {
        toolchain.push(("Python".to_string(), py));
    }
    Some(Manifest {
        file: "pyproject.toml".into(),
        ecosystem: "python",
        name: text("name"),
        description: text("description"),
        deps,
        toolchain,
    })
}

pub fn parse_go_mod(content: &str) -> Option<Manifest> {
    let mut m = Manifest {
        file: "go.mod".into(),
        ecosystem: "go",
        ..Manifest::default()
    };
    let mut in_require = false;
    for line in content.lines().map(str::trim) {
        if let Some(module) = line.strip_prefix("module ") {
            m.name = module.trim().rsplit('/').next().map(str::to_string);
        } else if let Some(v) = line.strip_prefix("go ") {
            m.toolchain.push(("Go".to_string(), v.trim().to_string()));
        } else if line.starts_with("require (") {
            in_require = true;
        } else if in_require && line == ")" {
            in_require = false;
        } else if in_require || line.starts_with("require ") {
            let spec = line.trim_start_matches("require ").split("//").next().unwrap_or_default();
            let mut parts = spec.split_whitespace();
            if let (Some(name), Some(version)) = (parts.next(), parts.next()) {
                m.deps.push(DepEntry {
                    name: name.to_string(),
                    version: version.to_string(),
                    kind: DepKind::Runtime,
                });
            }
        }
    }
    m.name.as_ref()?;
    Some(m)
}

/// First root-level manifest that parses, in detection order.
pub fn parse_manifest(files: &[&SourceFile]) -> Option<(Manifest, usize)> {
    let parsers: [(&str, fn(&str) -> Option<Manifest>); 4] = [
        ("Cargo.toml", parse_cargo_toml),
        ("package.json", parse_package_json),
        ("pyproject.toml", parse_pyproject_toml),
        ("go.mod", parse_go_mod),
    ];
    parsers.iter().find_map(|(name, parse)| {
        let idx = files.iter().position(|f| f.rel_path == *name)?;
        parse(&files[idx].content).map(|m| (m, idx))
    })
}

fn line_of(content: &str, needle: &str) -> u32 {
    content
        .lines()
        .position(|l| l.contains(needle))
        .map(|i| i as u32 + 1)
        .unwrap_or(1)
}

// ── Agent ───────────────────────────────────────────────────────────────────

pub struct ManifestAgent;

impl Agent for ManifestAgent {
    fn name(&self) -> &'static str {
        AGENT
    }

    fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
        let mut out = AgentOutput::new(AGENT);
        let roots: Vec<&SourceFile> = input.files.files.iter().filter(|f| !f.rel_path.contains('/')).collect();
        let Some((manifest, idx)) = parse_manifest(&roots) else {
            return Ok(out);
        };
        let file = roots[idx];
        out.coverage.files_total = 1;
        if !out.consider(input, file) {
            return Ok(out);
        }

        let feature = manifest.name.clone().unwrap_or_else(|| "Project".to_string());
        let one_liner = manifest
            .description
            .clone()
            .unwrap_or_else(|| format!("{} package", manifest.ecosystem));
        let name_line = manifest.name.as_deref().map(|n| line_of(&file.content, n)).unwrap_or(1);
        out.push(
            input,
            Finding::new(AGENT, FindingType::Feature, feature.as_str())
                .with_body(format!("{one_liner}. Declared in {}.", manifest.file))
                .with_meta("one_liner", one_liner.as_str())
                .with_meta("tags", manifest.ecosystem)
                .with_evidence(file.evidence(name_line, name_line)),
        );

        let mut seen = Vec::new();
        for dep in &manifest.deps {
            let Some((_, label, purpose)) = FRAMEWORKS.iter().find(|(n, _, _)| *n == dep.name) else {
                continue;
            };
            if seen.contains(label) {
                continue;
            }
            seen.push(*label);
            let role = match dep.kind {
                DepKind::Runtime => "dependency",
                DepKind::Dev => "dev dependency",
                DepKind::Build => "build dependency",
            };
            let line = line_of(&file.content, &dep.name);
            out.push(
                input,
                Finding::new(AGENT, FindingType::Decision, format!("Use {label}"))
                    .with_body(format!("{label} for {purpose}."))
                    .with_meta("feature", feature.as_str())
                    .with_meta("summary", format!("{label} for {purpose}"))
                    .with_meta("reasoning", format!("Declared as a {role} in {} ({})", manifest.file, dep.version))
                    .with_evidence(file.evidence(line, line))
                    .with_confidence(0.9),
            );
        }

        for (label, value) in &manifest.toolchain {
            let line = line_of(&file.content, value);
            out.push(
                input,
                Finding::new(AGENT, FindingType::Constraint, format!("{label} {value}"))
                    .with_body(format!("The toolchain is pinned to {label} {value} in {}.", manifest.file))
                    .with_evidence(file.evidence(line, line)),
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
    fn cargo_manifest_yields_deps_and_toolchain() {
        let m = parse_cargo_toml(
            "[package]\nname = \"auth\"\nedition = \"2021\"\n\n[dependencies]\nserde = { version = \"1.0\", features = [\"derive\"] }\nanyhow = \"1.0\"\n\n[dev-dependencies]\ntempfile = \"3\"\n",
        )
        .unwrap();
        assert_eq!(m.name.as_deref(), Some("auth"));
        assert_eq!(m.deps.len(), 3);
        let serde = m.deps.iter().find(|d| d.name == "serde").unwrap();
        assert_eq!(serde.version, "1.0");
        assert_eq!(m.deps.iter().find(|d| d.name == "tempfile").unwrap().kind, DepKind::Dev);
        assert_eq!(m.toolchain, vec![("Rust edition".to_string(), "2021".to_string())]);
    }

    #[test]
    fn go_mod_and_pep508() {
        let m = parse_go_mod(
            "module github.com/acme/api\n\ngo 1.22\n\nrequire (\n\tgithub.com/gin-gonic/gin v1.9.1\n\tgorm.io/gorm v1.25.0 // indirect\n)\n",
        )
        .unwrap();
        assert_eq!(m.name.as_deref(), Some("api"));
        assert_eq!(m.deps.len(), 2);
        assert_eq!(m.deps[1].version, "v1.25.0");
        assert_eq!(split_pep508("requests>=2.28"), ("requests", ">=2.28"));
        assert_eq!(split_pep508("rich"), ("rich", "*"));
    }

    #[test]
    fn agent_emits_feature_decisions_and_constraints() {
        let pkg = r#"{
  "name": "web",
  "description": "Customer portal",
  "engines": { "node": ">=20" },
  "dependencies": { "react": "^18.2.0", "jsonwebtoken": "^9.0.0", "left-pad": "1.0.0" },
  "devDependencies": { "vitest": "^1.0.0" }
}"#;
        let input = input(&[("package.json", pkg), ("nested/package.json", "{}")]);
        let out = ManifestAgent.run(&input).unwrap();
        let titles: Vec<_> = out.findings.iter().map(|f| (f.finding_type, f.title.as_str())).collect();
        assert_eq!(
            titles,
            vec![
                (FindingType::Feature, "web"),
                (FindingType::Decision, "Use React"),
                (FindingType::Decision, "Use JWT"),
                (FindingType::Decision, "Use Vitest"),
                (FindingType::Constraint, "Node.js >=20"),
            ]
        );
        assert_eq!(out.findings[0].meta("one_liner"), Some("Customer portal"));
        let jwt = &out.findings[2];
        assert_eq!(jwt.meta("feature"), Some("web"));
        assert_eq!(jwt.evidence[0].start_line, Some(5));
    }

    #[test]
    fn no_manifest_no_findings() {
        let out = ManifestAgent.run(&input(&[("src/main.rs", "fn main() {}")])).unwrap();
        assert!(out.findings.is_empty());
        assert_eq!(out.coverage.percent(), 100.0);
    }
}
