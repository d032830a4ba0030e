//! Workspace shape detection: single repo, monorepo, or a directory of
//! independent services.
//!
//! Root markers are checked in a fixed order and the first hit decides. A
//! root manifest that declares workspace members makes a monorepo; any other
//! root marker makes a single repo. With no root marker, child directories
//! (and `services/`, `apps/`, `packages/` grandchildren) carrying a marker are
//! services; two or more make a multi-service workspace.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

use crate::memory::model::{canonical_title, Finding, FindingRelation, FindingType, Workspace, WorkspaceKind};

/// Module manifests and lockfiles, in detection order.
pub const MARKERS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "go.mod",
    "pyproject.toml",
    "setup.py",
    "requirements.txt",
    "pom.xml",
    "build.gradle",
    "Gemfile",
    "composer.json",
    "go.work",
    "pnpm-workspace.yaml",
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
];

const SERVICE_PARENTS: &[&str] = &["services", "apps", "packages"];

const SKIP_DIRS: &[&str] = &[".git", ".taskwing", "node_modules", "target", "dist", "build", "vendor"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    /// Relative to the workspace root.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceInfo {
    pub root: PathBuf,
    pub kind: WorkspaceKind,
    pub services: Vec<ServiceInfo>,
    /// Marker that decided the shape, if any.
    pub marker: Option<String>,
}

impl WorkspaceInfo {
    pub fn id(&self) -> String {
        workspace_id(&self.root)
    }

    pub fn to_workspace(&self) -> Workspace {
        Workspace {
            id: self.id(),
            root_path: self.root.display().to_string(),
            kind: self.kind,
            services: self.services.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Agents run once per service only in multi-service workspaces.
    pub fn is_multi_service(&self) -> bool {
        self.kind == WorkspaceKind::MultiRepo
    }
}

/// Stable id from the canonical root path.
pub fn workspace_id(root: &Path) -> String {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    format!("{:016x}", xxh3_64(canonical.to_string_lossy().as_bytes()))
}

fn first_marker(dir: &Path) -> Option<&'static str> {
    MARKERS.iter().copied().find(|m| dir.join(m).is_file())
}

/// Workspace members declared by the marker file, if it declares any.
fn declared_members(root: &Path, marker: &str) -> Vec<String> {
    let read = |name: &str| fs::read_to_string(root.join(name)).ok();
    match marker {
        "Cargo.toml" => read(marker)
            .and_then(|c| toml::from_str::<toml::Value>(&c).ok())
            .and_then(|t| {
                t.get("workspace")
                    .and_then(|w| w.get("members"))
                    .and_then(|m| m.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            })
            .unwrap_or_default(),
        "package.json" => read(marker)
            .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
            .and_then(|j| {
                let ws = j.get("workspaces")?;
                let arr = ws.as_array().or_else(|| ws.get("packages").and_then(|p| p.as_array()))?;
                Some(arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            })
            .unwrap_or_default(),
        "go.work" => read(marker)
            .map(|c| {
                c.lines()
                    .map(str::trim)
                    .filter(|l| l.starts_with("./"))
                    .map(|l| l.trim_start_matches("./").to_string())
                    .collect()
            })
            .unwrap_or_default(),
        "pnpm-workspace.yaml" => read(marker)
            .map(|c| {
                c.lines()
                    .filter_map(|l| l.trim().strip_prefix("- "))
                    .map(|l| l.trim_matches(|ch| ch == '\'' || ch == '"').to_string())
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Expand `dir/*` globs one level; plain paths pass through.
fn expand_members(root: &Path, members: &[String]) -> Vec<ServiceInfo> {
    let mut out = Vec::new();
    for m in members {
        if let Some(parent) = m.strip_suffix("/*") {
            for child in child_dirs(&root.join(parent)) {
                let name = child.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                out.push(ServiceInfo {
                    name: name.clone(),
                    path: Path::new(parent).join(name),
                });
            }
        } else if root.join(m).is_dir() {
            let name = Path::new(m)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| m.clone());
            out.push(ServiceInfo {
                name,
                path: PathBuf::from(m),
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out.dedup_by(|a, b| a.path == b.path);
    out
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_str())
        })
        .collect();
    dirs.sort();
    dirs
}

fn service_candidates(root: &Path) -> Vec<ServiceInfo> {
    let mut out = Vec::new();
    for child in child_dirs(root) {
        let name = child.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if SERVICE_PARENTS.contains(&name.as_str()) && first_marker(&child).is_none() {
            for grand in child_dirs(&child) {
                if first_marker(&grand).is_some() {
                    let g = grand.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    out.push(ServiceInfo {
                        name: g.clone(),
                        path: Path::new(&name).join(g),
                    });
                }
            }
        } else if first_marker(&child).is_some() {
            out.push(ServiceInfo {
                name: name.clone(),
                path: PathBuf::from(name),
            });
        }
    }
    out
}

pub fn detect(root: &Path) -> Result<WorkspaceInfo> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace root {}", root.display()))?;

    if let Some(marker) = first_marker(&root) {
        let members = expand_members(&root, &declared_members(&root, marker));
        let kind = if members.is_empty() {
            WorkspaceKind::Single
        } else {
            WorkspaceKind::Monorepo
        };
        return Ok(WorkspaceInfo {
            root,
            kind,
            services: members,
            marker: Some(marker.to_string()),
        });
    }

    let services = service_candidates(&root);
    let kind = if services.len() >= 2 {
        WorkspaceKind::MultiRepo
    } else {
        WorkspaceKind::Single
    };
    Ok(WorkspaceInfo {
        root,
        kind,
        services: if kind == WorkspaceKind::MultiRepo { services } else { Vec::new() },
        marker: None,
    })
}

// ── Service namespacing ─────────────────────────────────────────────────────

fn prefixed(service: &str, title: &str) -> String {
    let tag = format!("[{service}] ");
    if title.starts_with(&tag) {
        title.to_string()
    } else {
        format!("{tag}{title}")
    }
}

fn rooted(service_path: &Path, rel: &str) -> String {
    let prefix = service_path.to_string_lossy().replace('\\', "/");
    if prefix.is_empty() || rel.starts_with(&format!("{prefix}/")) {
        return rel.to_string();
    }
    format!("{prefix}/{rel}")
}

/// Rewrites one service's agent output so it can share a workspace with
/// other services: titles and the relation endpoints naming them get a
/// `[service] ` prefix, `metadata.service` is set, and file paths become
/// relative to the workspace root. Symbol names keep their bare form.
pub fn namespace_findings(service: &ServiceInfo, findings: &mut [Finding], relations: &mut [FindingRelation]) {
    let named: HashSet<String> = findings
        .iter()
        .filter(|f| f.finding_type != FindingType::Symbol)
        .map(|f| canonical_title(&f.title))
        .collect();

    for f in findings.iter_mut() {
        if f.finding_type != FindingType::Symbol {
            f.title = prefixed(&service.name, &f.title);
        }
        if let Some(feature) = f.metadata.get_mut("feature") {
            *feature = prefixed(&service.name, feature);
        }
        if let Some(path) = f.metadata.get_mut("file_path") {
            *path = rooted(&service.path, path);
        }
        for ev in f.evidence.iter_mut() {
            ev.file_path = rooted(&service.path, &ev.file_path);
        }
        f.metadata.insert("service".to_string(), service.name.clone());
    }

    for r in relations.iter_mut() {
        if named.contains(&canonical_title(&r.from_title)) {
            r.from_title = prefixed(&service.name, &r.from_title);
        }
        if named.contains(&canonical_title(&r.to_title)) {
            r.to_title = prefixed(&service.name, &r.to_title);
        }
        for path in [&mut r.from_file, &mut r.to_file].into_iter().flatten() {
            *path = rooted(&service.path, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn plain_manifest_is_single() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Cargo.toml", "[package]\nname = \"x\"\n");
        let info = detect(tmp.path()).unwrap();
        assert_eq!(info.kind, WorkspaceKind::Single);
        assert_eq!(info.marker.as_deref(), Some("Cargo.toml"));
    }

    #[test]
    fn cargo_workspace_is_monorepo() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Cargo.toml", "[workspace]\nmembers = [\"crates/*\"]\n");
        touch(tmp.path(), "crates/core/Cargo.toml", "");
        touch(tmp.path(), "crates/cli/Cargo.toml", "");
        let info = detect(tmp.path()).unwrap();
        assert_eq!(info.kind, WorkspaceKind::Monorepo);
        let names: Vec<_> = info.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cli", "core"]);
        assert!(!info.is_multi_service());
    }

    #[test]
    fn sibling_services_are_multi_repo() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "api/go.mod", "module api\n");
        touch(tmp.path(), "services/web/package.json", "{}");
        touch(tmp.path(), "docs/README.md", "");
        let info = detect(tmp.path()).unwrap();
        assert_eq!(info.kind, WorkspaceKind::MultiRepo);
        let names: Vec<_> = info.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
        assert_eq!(info.services[1].path, Path::new("services").join("web"));
    }

    #[test]
    fn namespacing_prefixes_titles_and_paths() {
        use crate::memory::model::{EdgeKind, EvidenceRef};
        let svc = ServiceInfo {
            name: "api".into(),
            path: PathBuf::from("services/api"),
        };
        let mut findings = vec![
            Finding::new("manifest", FindingType::Feature, "User"),
            Finding::new("docs", FindingType::Decision, "Use JWT")
                .with_meta("feature", "User")
                .with_evidence(EvidenceRef {
                    file_path: "src/auth.rs".into(),
                    start_line: Some(1),
                    end_line: Some(2),
                    snippet_hash: String::new(),
                }),
            Finding::new("symbols", FindingType::Symbol, "login").with_meta("file_path", "src/auth.rs"),
        ];
        let mut relations = vec![
            FindingRelation::new("Use JWT", "User", EdgeKind::Related),
            FindingRelation::new("login", "Use JWT", EdgeKind::Implements)
                .between_files(Some("src/auth.rs".into()), None),
        ];
        namespace_findings(&svc, &mut findings, &mut relations);

        assert_eq!(findings[0].title, "[api] User");
        assert_eq!(findings[1].meta("feature"), Some("[api] User"));
        assert_eq!(findings[1].evidence[0].file_path, "services/api/src/auth.rs");
        assert_eq!(findings[2].title, "login");
        assert_eq!(findings[2].meta("file_path"), Some("services/api/src/auth.rs"));
        assert!(findings.iter().all(|f| f.meta("service") == Some("api")));
        assert_eq!(relations[0].from_title, "[api] Use JWT");
        assert_eq!(relations[1].from_title, "login");
        assert_eq!(relations[1].to_title, "[api] Use JWT");
        assert_eq!(relations[1].from_file.as_deref(), Some("services/api/src/auth.rs"));
        assert_eq!(relations[1].to_file, None);

        // idempotent
        namespace_findings(&svc, &mut findings, &mut relations);
        assert_eq!(findings[0].title, "[api] User");
        assert_eq!(findings[1].evidence[0].file_path, "services/api/src/auth.rs");
    }

    #[test]
    fn id_is_stable() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(workspace_id(tmp.path()), workspace_id(tmp.path()));
        assert_eq!(workspace_id(tmp.path()).len(), 16);
    }
}
