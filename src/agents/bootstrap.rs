//! Bootstrap: scan the workspace, run every agent, namespace per service,
//! then ingest the aggregate in one write. The report is always produced and
//! written to `last-bootstrap-report.json`, even in preview mode.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::runtime::AgentRuntime;
use super::stream::{StreamingOutput, TraceWriter};
use super::{scan_files, Agent, AgentError, AgentInput, AgentOutput, Coverage, ProposedOverview};
use crate::cancel::CancelToken;
use crate::config::AgentsConfig;
use crate::error::is_cancelled;
use crate::knowledge::{IngestOptions, IngestReport, KnowledgeService};
use crate::memory::model::{Finding, FindingRelation, WorkspaceKind};
use crate::workspace::{namespace_findings, ServiceInfo, WorkspaceInfo};
use crate::write_core::AtomicWriter;

pub const TRACE_FILE: &str = "logs/bootstrap.trace.jsonl";
pub const REPORT_FILE: &str = "last-bootstrap-report.json";

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Run agents and write the report, but do not ingest.
    pub preview: bool,
    pub cancel: CancelToken,
    pub workers: usize,
    pub event_buffer: usize,
    pub max_file_bytes: u64,
    pub verify_evidence: bool,
}

impl BootstrapOptions {
    pub fn from_config(cfg: &AgentsConfig) -> Self {
        Self {
            preview: false,
            cancel: CancelToken::new(),
            workers: cfg.effective_workers(),
            event_buffer: cfg.event_buffer,
            max_file_bytes: cfg.max_file_bytes,
            verify_evidence: cfg.verify_evidence,
        }
    }
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self::from_config(&AgentsConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub findings: usize,
    pub relationships: usize,
    pub coverage: Coverage,
    pub coverage_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl AgentReport {
    fn of(out: &AgentOutput, service: Option<&ServiceInfo>) -> Self {
        Self {
            agent: out.agent.clone(),
            service: service.map(|s| s.name.clone()),
            duration_ms: out.duration.as_millis() as u64,
            tokens_used: out.tokens_used,
            findings: out.findings.len(),
            relationships: out.relationships.len(),
            coverage: out.coverage,
            coverage_pct: out.coverage.percent(),
            error: out.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub agent: String,
    pub error: AgentError,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub workspace_id: String,
    pub kind: WorkspaceKind,
    pub services: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub preview: bool,
    pub cancelled: bool,
    pub agents: Vec<AgentReport>,
    pub findings_histogram: BTreeMap<String, usize>,
    pub total_findings: usize,
    pub total_relationships: usize,
    pub coverage_pct: f64,
    pub failures: Vec<ServiceFailure>,
    pub events_dropped: u64,
    pub ingested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_error: Option<String>,
    pub overview_stored: bool,
}

impl BootstrapReport {
    /// False whenever the caller should exit non-zero.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failures.is_empty() && self.refused_reason.is_none() && self.ingest_error.is_none()
    }
}

/// Where one agent pass runs: the whole root or one service.
struct Target<'a> {
    service: Option<&'a ServiceInfo>,
    dir: PathBuf,
}

fn targets(info: &WorkspaceInfo) -> Vec<Target<'_>> {
    if info.is_multi_service() {
        info.services
            .iter()
            .map(|s| Target {
                service: Some(s),
                dir: info.root.join(&s.path),
            })
            .collect()
    } else {
        vec![Target {
            service: None,
            dir: info.root.clone(),
        }]
    }
}

fn histogram(findings: &[Finding]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for f in findings {
        *out.entry(format!("{:?}", f.finding_type).to_lowercase()).or_default() += 1;
    }
    out
}

#[derive(Default)]
struct Collected {
    findings: Vec<Finding>,
    relations: Vec<FindingRelation>,
    overview: Option<ProposedOverview>,
    coverage: Coverage,
}

pub fn bootstrap(
    svc: &KnowledgeService,
    info: &WorkspaceInfo,
    memory_dir: &Path,
    agents: &[Arc<dyn Agent>],
    opts: &BootstrapOptions,
) -> Result<BootstrapReport> {
    let clock = svc.repo().clock();
    let stream = Arc::new(StreamingOutput::new(opts.event_buffer, clock.clone()));
    match TraceWriter::create(&memory_dir.join(TRACE_FILE)) {
        Ok(writer) => stream.subscribe(Box::new(writer)),
        Err(e) => warn!("bootstrap trace disabled: {e:#}"),
    }

    let mut report = BootstrapReport {
        workspace_id: svc.workspace_id().to_string(),
        kind: info.kind,
        services: info.services.iter().map(|s| s.name.clone()).collect(),
        started_at: clock.now(),
        finished_at: clock.now(),
        preview: opts.preview,
        cancelled: false,
        agents: Vec::new(),
        findings_histogram: BTreeMap::new(),
        total_findings: 0,
        total_relationships: 0,
        coverage_pct: 100.0,
        failures: Vec::new(),
        events_dropped: 0,
        ingested: false,
        ingest: None,
        refused_reason: None,
        ingest_error: None,
        overview_stored: false,
    };
    info!(workspace = %report.workspace_id, kind = %info.kind, services = report.services.len(), "bootstrap started");

    let runtime = AgentRuntime::new(opts.workers);
    let mut all = Collected::default();
    for target in targets(info) {
        if opts.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let service_name = target.service.map(|s| s.name.clone());
        let files = match scan_files(&target.dir, opts.max_file_bytes, &opts.cancel) {
            Ok(files) => files,
            Err(e) if is_cancelled(&e) => {
                report.cancelled = true;
                break;
            }
            Err(e) if target.service.is_some() => {
                warn!(service = ?service_name, "scan failed: {e:#}");
                report.failures.push(ServiceFailure {
                    service: service_name,
                    agent: "scan".into(),
                    error: AgentError::Failed(format!("{e:#}")),
                });
                continue;
            }
            Err(e) => return Err(e),
        };
        let input = AgentInput {
            root: target.dir.clone(),
            service: service_name.clone(),
            files: Arc::new(files),
            cancel: opts.cancel.clone(),
            stream: stream.clone(),
        };

        let mut local = Collected::default();
        let mut failed = false;
        for mut out in runtime.run(agents, &input)? {
            report.agents.push(AgentReport::of(&out, target.service));
            local.coverage.files_total += out.coverage.files_total;
            local.coverage.files_analyzed += out.coverage.files_analyzed;
            match out.error.clone() {
                Some(AgentError::Cancelled) => report.cancelled = true,
                Some(error) => {
                    failed = true;
                    report.failures.push(ServiceFailure {
                        service: service_name.clone(),
                        agent: out.agent.clone(),
                        error,
                    });
                }
                None => {}
            }
            if local.overview.is_none() {
                local.overview = out.overview.take();
            }
            local.findings.append(&mut out.findings);
            local.relations.append(&mut out.relationships);
        }
        report.total_findings += local.findings.len();
        report.total_relationships += local.relations.len();
        for (k, n) in histogram(&local.findings) {
            *report.findings_histogram.entry(k).or_default() += n;
        }
        all.coverage.files_total += local.coverage.files_total;
        all.coverage.files_analyzed += local.coverage.files_analyzed;

        // A failed service is left out; the others still go in.
        if failed && target.service.is_some() {
            warn!(service = ?service_name, "service excluded from ingest");
            continue;
        }
        if let Some(service) = target.service {
            namespace_findings(service, &mut local.findings, &mut local.relations);
        }
        all.findings.append(&mut local.findings);
        all.relations.append(&mut local.relations);
        if all.overview.is_none() {
            all.overview = local.overview;
        }
    }
    report.coverage_pct = all.coverage.percent();

    report.refused_reason = if report.cancelled {
        Some("cancelled before all agents finished".into())
    } else if !info.is_multi_service() && !report.failures.is_empty() {
        Some(format!("{} agent(s) failed; nothing was written", report.failures.len()))
    } else {
        None
    };

    if !opts.preview && report.refused_reason.is_none() {
        ingest_into(svc, &all, opts, &mut report);
    }

    report.events_dropped = stream.finish();
    report.finished_at = clock.now();
    if let Err(e) = AtomicWriter::default().write_json(&memory_dir.join(REPORT_FILE), &report) {
        warn!("failed to write bootstrap report: {e:#}");
    }
    info!(
        findings = report.total_findings,
        ingested = report.ingested,
        failures = report.failures.len(),
        "bootstrap finished"
    );
    Ok(report)
}

fn ingest_into(svc: &KnowledgeService, all: &Collected, opts: &BootstrapOptions, report: &mut BootstrapReport) {
    let ingest_opts = IngestOptions {
        verify_evidence: opts.verify_evidence,
        cancel: opts.cancel.clone(),
    };
    match svc.ingest(&all.findings, &all.relations, &ingest_opts) {
        Ok(ingest) => {
            report.ingested = true;
            report.ingest = Some(ingest);
        }
        Err(e) if is_cancelled(&e) => {
            report.cancelled = true;
            report.refused_reason = Some("cancelled during ingest; nothing was written".into());
            return;
        }
        Err(e) => {
            report.ingest_error = Some(format!("{e:#}"));
            return;
        }
    }
    if let Some(o) = &all.overview {
        match svc.propose_overview(&o.short, &o.long) {
            Ok(stored) => report.overview_stored = stored,
            Err(e) => warn!("overview not stored: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default_agents;
    use crate::clock::FixedClock;
    use crate::memory::Repo;
    use crate::providers::local::LocalEmbedder;
    use crate::providers::{FsSource, Providers};
    use crate::workspace;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    fn service_for(info: &WorkspaceInfo, memory_dir: &Path) -> KnowledgeService {
        let repo = Repo::open_with_clock(&memory_dir.join("memory.db"), Arc::new(FixedClock::at_millis(1_700_000_000_000))).unwrap();
        let providers = Providers::none().with_embedder(Arc::new(LocalEmbedder::default()));
        KnowledgeService::new(Arc::new(repo), providers, Arc::new(FsSource::new(&info.root)), info.to_workspace()).unwrap()
    }

    struct Failing;

    impl Agent for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
            if input.service.as_deref() == Some("web") {
                anyhow::bail!("parser crashed");
            }
            Ok(AgentOutput::new("failing"))
        }
    }

    #[test]
    fn single_repo_is_ingested_and_reported() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "Cargo.toml", "[package]\nname = \"ledger\"\ndescription = \"Double-entry ledger\"\n");
        touch(root, "README.md", "# ledger\n\nA double-entry ledger. Fast.\n");
        touch(root, "src/lib.rs", "/// Post a journal entry.\npub fn post_entry() {\n    balance();\n}\n\npub fn balance() {}\n");
        let info = workspace::detect(root).unwrap();
        let memory_dir = root.join(".taskwing/memory");
        let svc = service_for(&info, &memory_dir);

        let report = bootstrap(&svc, &info, &memory_dir, &default_agents(), &BootstrapOptions::default()).unwrap();
        assert!(report.is_success(), "{report:?}");
        assert!(report.ingested);
        assert_eq!(report.findings_histogram.get("feature"), Some(&1));
        assert_eq!(report.findings_histogram.get("symbol"), Some(&2));
        assert!(report.total_relationships >= 1);
        assert!(report.overview_stored);

        let names: Vec<_> = svc.list_features().unwrap().into_iter().map(|f| f.name).collect();
        assert!(names.contains(&"ledger".to_string()));
        assert!(memory_dir.join(REPORT_FILE).exists());
        let trace = fs::read_to_string(memory_dir.join(TRACE_FILE)).unwrap();
        assert!(trace.lines().any(|l| l.contains("\"agent_finished\"")));
    }

    #[test]
    fn preview_reports_without_writing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "package.json", "{\"name\": \"shop\"}");
        let info = workspace::detect(root).unwrap();
        let memory_dir = root.join(".taskwing/memory");
        let svc = service_for(&info, &memory_dir);
        let opts = BootstrapOptions {
            preview: true,
            ..BootstrapOptions::default()
        };
        let report = bootstrap(&svc, &info, &memory_dir, &default_agents(), &opts).unwrap();
        assert!(!report.ingested);
        assert_eq!(report.total_findings, 1);
        assert!(svc.list_features().unwrap().is_empty());
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(memory_dir.join(REPORT_FILE)).unwrap()).unwrap();
        assert_eq!(written["preview"], true);
    }

    #[test]
    fn failed_service_is_excluded_others_continue() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "api/package.json", "{\"name\": \"User\"}");
        touch(root, "web/package.json", "{\"name\": \"User\"}");
        let info = workspace::detect(root).unwrap();
        assert_eq!(info.kind, WorkspaceKind::MultiRepo);
        let memory_dir = root.join(".taskwing/memory");
        let svc = service_for(&info, &memory_dir);

        let mut agents = default_agents();
        agents.push(Arc::new(Failing));
        let report = bootstrap(&svc, &info, &memory_dir, &agents, &BootstrapOptions::default()).unwrap();
        assert!(!report.is_success());
        assert!(report.ingested);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].service.as_deref(), Some("web"));
        let names: Vec<_> = svc.list_features().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["[api] User".to_string()]);
    }

    #[test]
    fn single_repo_failure_refuses_ingest() {
        struct Broken;
        impl Agent for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn run(&self, _: &AgentInput) -> Result<AgentOutput> {
                anyhow::bail!("no")
            }
        }
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "go.mod", "module example.com/svc\n\ngo 1.22\n");
        let info = workspace::detect(root).unwrap();
        let memory_dir = root.join(".taskwing/memory");
        let svc = service_for(&info, &memory_dir);
        let mut agents = default_agents();
        agents.push(Arc::new(Broken));
        let report = bootstrap(&svc, &info, &memory_dir, &agents, &BootstrapOptions::default()).unwrap();
        assert!(!report.ingested);
        assert!(report.refused_reason.is_some());
        assert!(svc.list_features().unwrap().is_empty());
    }
}
