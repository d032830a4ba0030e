//! Knowledge service: the facade agents, hooks and the CLI talk to. Wraps the
//! repository with ingest, search, invariant-checked CRUD and embeddings on
//! every write.

pub mod evidence;
pub mod ingest;

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::RetrievalConfig;
use crate::memory::features::{self, NewDecision, NewFeature};
use crate::memory::graph::{self, Neighbor};
use crate::memory::model::{
    Decision, Direction, Edge, EdgeKind, Feature, Finding, FindingRelation, Node, Note, NoteKind,
    Overview, Workspace,
};
use crate::memory::notes::{self, NewNote};
use crate::memory::{edges, get_node, symbols, vectors, workspace_row, Repo};
use crate::providers::{FileSource, Providers};
use crate::retrieval::{Retriever, SearchOptions, SearchResponse};
pub use ingest::{IngestOptions, IngestReport};

pub struct KnowledgeService {
    repo: Arc<Repo>,
    providers: Providers,
    files: Arc<dyn FileSource>,
    workspace: Workspace,
    retrieval: RetrievalConfig,
}

impl KnowledgeService {
    /// Registers (or refreshes) the workspace row.
    pub fn new(repo: Arc<Repo>, providers: Providers, files: Arc<dyn FileSource>, workspace: Workspace) -> Result<Self> {
        let now = repo.now_millis();
        repo.write(|tx| workspace_row::upsert_workspace(tx, &workspace, now))?;
        Ok(Self {
            repo,
            providers,
            files,
            workspace,
            retrieval: RetrievalConfig::default(),
        })
    }

    pub fn with_retrieval(mut self, cfg: RetrievalConfig) -> Self {
        self.retrieval = cfg;
        self
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace.id
    }

    /// Embed nodes once their write has committed. Failures only log;
    /// `refresh_embeddings` fills the gap later.
    fn embed_after(&self, ids: &[String]) {
        let Some(embedder) = &self.providers.embedder else {
            return;
        };
        if let Err(err) = ingest::embed_strict(&self.repo, embedder.as_ref(), ids, &CancelToken::new()) {
            warn!("embedding skipped, search falls back to keywords: {err:#}");
        }
    }

    // ── Ingest and search ───────────────────────────────────────────────────

    pub fn ingest(
        &self,
        findings: &[Finding],
        relations: &[FindingRelation],
        opts: &IngestOptions,
    ) -> Result<IngestReport> {
        ingest::ingest(
            &self.repo,
            &self.providers,
            self.files.as_ref(),
            &self.workspace.id,
            findings,
            relations,
            opts,
        )
    }

    /// Options scoped to this workspace with the configured default limit.
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions::new(&self.workspace.id, self.retrieval.limit)
    }

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        Retriever::new(&self.repo, &self.providers, &self.retrieval).search(query, opts)
    }

    pub fn search_streaming(&self, query: &str, opts: &SearchOptions, out: &mut dyn Write) -> Result<SearchResponse> {
        Retriever::new(&self.repo, &self.providers, &self.retrieval).search_streaming(query, opts, out)
    }

    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.repo.read(|c| get_node(c, id))
    }

    // ── Features and decisions ──────────────────────────────────────────────

    pub fn create_feature(&self, mut new: NewFeature) -> Result<Feature> {
        new.workspace_id = self.workspace.id.clone();
        let now = self.repo.now_millis();
        let f = self.repo.write(|tx| features::create_feature(tx, now, new))?;
        self.embed_after(&[f.id.clone()]);
        Ok(f)
    }

    pub fn get_feature(&self, id: &str) -> Result<Feature> {
        self.repo.read(|c| features::get_feature(c, id))
    }

    pub fn find_feature(&self, name: &str) -> Result<Option<Feature>> {
        self.repo.read(|c| features::find_feature(c, &self.workspace.id, name))
    }

    pub fn list_features(&self) -> Result<Vec<Feature>> {
        self.repo.read(|c| features::list_features(c, &self.workspace.id))
    }

    pub fn update_feature(&self, feature: &mut Feature) -> Result<()> {
        let now = self.repo.now_millis();
        self.repo.write(|tx| features::update_feature(tx, now, feature))?;
        self.embed_after(&[feature.id.clone()]);
        Ok(())
    }

    /// Refuses while dependents exist unless `force`.
    pub fn delete_feature(&self, id: &str, force: bool) -> Result<()> {
        self.repo.write(|tx| features::delete_feature(tx, id, force))
    }

    pub fn create_decision(&self, mut new: NewDecision) -> Result<Decision> {
        new.workspace_id = self.workspace.id.clone();
        let now = self.repo.now_millis();
        let d = self.repo.write(|tx| features::create_decision(tx, now, new))?;
        self.embed_after(&[d.id.clone()]);
        Ok(d)
    }

    pub fn list_decisions(&self, feature_id: &str) -> Result<Vec<Decision>> {
        self.repo.read(|c| features::list_decisions(c, feature_id))
    }

    pub fn update_decision(&self, decision: &mut Decision) -> Result<()> {
        let now = self.repo.now_millis();
        self.repo.write(|tx| features::update_decision(tx, now, decision))?;
        self.embed_after(&[decision.id.clone()]);
        Ok(())
    }

    pub fn delete_decision(&self, id: &str) -> Result<()> {
        self.repo.write(|tx| features::delete_decision(tx, id))
    }

    // ── Notes and overview ──────────────────────────────────────────────────

    pub fn create_note(&self, mut new: NewNote) -> Result<Note> {
        new.workspace_id = self.workspace.id.clone();
        let now = self.repo.now_millis();
        let n = self.repo.write(|tx| notes::create_note(tx, now, new))?;
        self.embed_after(&[n.id.clone()]);
        Ok(n)
    }

    pub fn list_notes(&self, kind: NoteKind) -> Result<Vec<Note>> {
        self.repo.read(|c| notes::list_notes(c, kind, &self.workspace.id))
    }

    pub fn delete_note(&self, kind: NoteKind, id: &str) -> Result<()> {
        self.repo.write(|tx| notes::delete_note(tx, kind, id))
    }

    pub fn overview(&self) -> Result<Option<Overview>> {
        self.repo.read(|c| notes::get_overview(c, &self.workspace.id))
    }

    /// Store a generated overview; false when a manual edit is kept instead.
    pub fn propose_overview(&self, short: &str, long: &str) -> Result<bool> {
        let now = self.repo.now_millis();
        let ws = self.workspace.id.clone();
        let stored = self
            .repo
            .write(|tx| notes::put_generated_overview(tx, now, &ws, short, long))?;
        if stored {
            self.embed_after(&[Overview::node_id_for(&ws)]);
        }
        Ok(stored)
    }

    pub fn edit_overview(&self, short: &str, long: &str) -> Result<Overview> {
        let now = self.repo.now_millis();
        let ws = self.workspace.id.clone();
        let o = self.repo.write(|tx| notes::edit_overview(tx, now, &ws, short, long))?;
        self.embed_after(&[Overview::node_id_for(&ws)]);
        Ok(o)
    }

    // ── Graph ───────────────────────────────────────────────────────────────

    /// Cycle-checked for dependency kinds. Returns true when the edge is new.
    pub fn link(&self, edge: &Edge) -> Result<bool> {
        let now = self.repo.now_millis();
        self.repo.write(|tx| {
            graph::cycle_check(tx, edge)?;
            edges::add_edge(tx, now, edge)
        })
    }

    pub fn unlink(&self, from: &str, to: &str, kind: EdgeKind) -> Result<bool> {
        self.repo.write(|tx| edges::remove_edge(tx, from, to, kind))
    }

    pub fn neighbors(&self, id: &str, kinds: Option<&[EdgeKind]>, direction: Direction) -> Result<Vec<Neighbor>> {
        self.repo.read(|c| graph::neighbors(c, id, kinds, direction))
    }

    /// "Why does X depend on Y": every shortest dependency path.
    pub fn shortest_paths(&self, from: &str, to: &str, max_len: usize) -> Result<Vec<Vec<String>>> {
        self.repo.read(|c| graph::shortest_paths(c, from, to, max_len, None))
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Drop symbols not seen by an indexing pass within `grace`.
    pub fn gc_symbols(&self, grace: Duration) -> Result<usize> {
        let cutoff = self.repo.now_millis() - grace.as_millis() as i64;
        let removed = self
            .repo
            .write(|tx| symbols::gc_stale_symbols(tx, &self.workspace.id, cutoff))?;
        if removed > 0 {
            info!(removed, "stale symbols collected");
        }
        Ok(removed)
    }

    /// Embed every searchable node lacking a vector for the current model.
    /// Provider failures surface here: the caller asked for this work.
    pub fn refresh_embeddings(&self, cancel: &CancelToken) -> Result<usize> {
        let Some(embedder) = &self.providers.embedder else {
            warn!("no embedder configured; nothing to refresh");
            return Ok(0);
        };
        let tag = embedder.model_tag();
        let ws = self.workspace.id.clone();
        let ids: Vec<String> = self.repo.read(|c| {
            Ok(vectors::docs_missing_vectors(c, &ws, &tag)?
                .into_iter()
                .map(|d| d.node_id)
                .collect())
        })?;
        ingest::embed_strict(&self.repo, embedder.as_ref(), &ids, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::{domain_error, MemoryError};
    use crate::memory::model::{Symbol, SymbolKind, WorkspaceKind};
    use crate::providers::local::LocalEmbedder;
    use crate::providers::{Embedder, FsSource};
    use tempfile::TempDir;

    fn service() -> (TempDir, KnowledgeService, Arc<FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at_millis(1_700_000_000_000));
        let repo = Arc::new(Repo::open_with_clock(&tmp.path().join("memory.db"), clock.clone()).unwrap());
        let ws = Workspace {
            id: "wsknowledge0001".into(),
            root_path: tmp.path().display().to_string(),
            kind: WorkspaceKind::Single,
            services: vec![],
        };
        let providers = Providers::none().with_embedder(Arc::new(LocalEmbedder::default()));
        let files = Arc::new(FsSource::new(tmp.path()));
        let svc = KnowledgeService::new(repo, providers, files, ws).unwrap();
        (tmp, svc, clock)
    }

    #[test]
    fn crud_writes_embed() {
        let (_tmp, svc, _) = service();
        let f = svc.create_feature(NewFeature::named("ignored", "Billing")).unwrap();
        assert_eq!(f.workspace_id, svc.workspace_id());
        let tag = LocalEmbedder::default().model_tag();
        assert!(svc.repo().read(|c| vectors::get_vector(c, &f.id, &tag)).unwrap().is_some());
        assert_eq!(svc.get_feature(&f.id).unwrap(), f);
    }

    #[test]
    fn link_rejects_dependency_cycles() {
        let (_tmp, svc, _) = service();
        let a = svc.create_feature(NewFeature::named("", "A")).unwrap();
        let b = svc.create_feature(NewFeature::named("", "B")).unwrap();
        assert!(svc.link(&Edge::new(&a.id, &b.id, EdgeKind::DependsOn)).unwrap());
        let err = svc.link(&Edge::new(&b.id, &a.id, EdgeKind::DependsOn)).unwrap_err();
        assert!(matches!(domain_error(&err), Some(MemoryError::CycleWould { .. })));
        assert_eq!(svc.shortest_paths(&a.id, &b.id, 4).unwrap(), vec![vec![a.id.clone(), b.id.clone()]]);
    }

    #[test]
    fn forced_delete_leaves_no_dangling_edges() {
        let (_tmp, svc, _) = service();
        let a = svc.create_feature(NewFeature::named("", "A")).unwrap();
        let b = svc.create_feature(NewFeature::named("", "B")).unwrap();
        svc.link(&Edge::new(&a.id, &b.id, EdgeKind::DependsOn)).unwrap();
        assert!(svc.delete_feature(&b.id, false).is_err());
        svc.delete_feature(&b.id, true).unwrap();
        assert!(svc.neighbors(&a.id, None, Direction::Both).unwrap().is_empty());
    }

    #[test]
    fn manual_overview_survives_regeneration() {
        let (_tmp, svc, _) = service();
        assert!(svc.propose_overview("CLI tool", "generated").unwrap());
        svc.edit_overview("Task runner", "hand written").unwrap();
        assert!(!svc.propose_overview("CLI tool", "generated again").unwrap());
        assert_eq!(svc.overview().unwrap().unwrap().short_description, "Task runner");
    }

    #[test]
    fn gc_removes_unseen_symbols() {
        let (_tmp, svc, clock) = service();
        let ws = svc.workspace_id().to_string();
        let now = svc.repo().now_millis();
        svc.repo()
            .write(|tx| {
                let mut s = Symbol {
                    id: String::new(),
                    workspace_id: ws.clone(),
                    name: "old_fn".into(),
                    kind: SymbolKind::Function,
                    file_path: "src/old.rs".into(),
                    start_line: 1,
                    end_line: 2,
                    signature: "fn old_fn()".into(),
                    doc_comment: String::new(),
                    module_path: String::new(),
                    last_seen_at: now,
                };
                symbols::upsert_symbol(tx, &mut s)
            })
            .unwrap();
        clock.advance(chrono::Duration::days(8));
        assert_eq!(svc.gc_symbols(Duration::from_secs(7 * 24 * 3600)).unwrap(), 1);
    }

    #[test]
    fn refresh_fills_missing_vectors() {
        let tmp = TempDir::new().unwrap();
        let repo = Arc::new(Repo::open(&tmp.path().join("memory.db")).unwrap());
        let ws = Workspace {
            id: "wsrefresh000001".into(),
            root_path: String::new(),
            kind: WorkspaceKind::Single,
            services: vec![],
        };
        let files: Arc<dyn FileSource> = Arc::new(FsSource::new(tmp.path()));
        let bare = KnowledgeService::new(repo.clone(), Providers::none(), files.clone(), ws.clone()).unwrap();
        bare.create_feature(NewFeature::named("", "Search")).unwrap();

        let with = Providers::none().with_embedder(Arc::new(LocalEmbedder::default()));
        let svc = KnowledgeService::new(repo, with, files, ws).unwrap();
        assert_eq!(svc.refresh_embeddings(&CancelToken::new()).unwrap(), 1);
        assert_eq!(svc.refresh_embeddings(&CancelToken::new()).unwrap(), 0);
    }
}
