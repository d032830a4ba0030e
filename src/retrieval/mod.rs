//! Hybrid retrieval: keyword and vector channels in parallel, fused by
//! reciprocal rank, optionally reranked, optionally answered.

pub mod fusion;

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, warn};

use crate::answer::{self, Answer};
use crate::cancel::CancelToken;
use crate::config::RetrievalConfig;
use crate::error::{domain_error, is_cancelled, MemoryError};
use crate::memory::fts::{self, NodeDoc};
use crate::memory::model::{NodeHit, NodeType, SearchFilters};
use crate::memory::{vectors, Repo};
use crate::providers::{EmbedRole, Providers};
use fusion::{Fused, FusionWeights, ResultSource};

const MIN_CANDIDATES: usize = 20;
const SNIPPET_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub workspace_id: Option<String>,
    pub type_filter: Option<Vec<NodeType>>,
    pub include_symbols: bool,
    pub include_unverified: bool,
    pub disable_vector: bool,
    pub use_reranker: bool,
    pub generate_answer: bool,
    pub cancel: CancelToken,
}

impl SearchOptions {
    pub fn new(workspace_id: &str, limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            workspace_id: Some(workspace_id.to_string()),
            type_filter: None,
            include_symbols: false,
            include_unverified: false,
            disable_vector: false,
            use_reranker: false,
            generate_answer: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            workspace_id: self.workspace_id.clone(),
            node_types: self.type_filter.clone(),
            include_symbols: self.include_symbols,
            include_unverified: self.include_unverified,
        }
    }

    /// Per-channel candidate depth.
    pub fn candidate_limit(&self) -> usize {
        (2 * self.limit).max(MIN_CANDIDATES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultNode {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub title: String,
    pub summary: String,
    pub score: f64,
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ResultNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub answer_unavailable: bool,
    /// Channels or stages that failed and were skipped.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

fn is_external(err: &anyhow::Error) -> bool {
    matches!(domain_error(err), Some(MemoryError::External { .. }))
}

pub struct Retriever<'a> {
    repo: &'a Repo,
    providers: &'a Providers,
    config: &'a RetrievalConfig,
}

impl<'a> Retriever<'a> {
    pub fn new(repo: &'a Repo, providers: &'a Providers, config: &'a RetrievalConfig) -> Self {
        Self {
            repo,
            providers,
            config,
        }
    }

    fn weights(&self) -> FusionWeights {
        FusionWeights {
            fts: self.config.fts_weight,
            vector: self.config.vector_weight,
            k: self.config.rrf_k,
        }
    }

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        self.run(query, opts, None)
    }

    /// Like `search`, streaming the answer (if requested) into `out`.
    pub fn search_streaming(&self, query: &str, opts: &SearchOptions, out: &mut dyn Write) -> Result<SearchResponse> {
        self.run(query, opts, Some(out))
    }

    fn fts_channel(&self, query: &str, filters: &SearchFilters, depth: usize) -> Result<Vec<NodeHit>> {
        self.repo.read(|conn| fts::fts_search(conn, query, filters, depth))
    }

    /// `Ok(None)` when the channel is unavailable or degraded.
    fn vector_channel(
        &self,
        query: &str,
        filters: &SearchFilters,
        depth: usize,
        cancel: &CancelToken,
        degraded: &mut Vec<String>,
    ) -> Result<Option<Vec<NodeHit>>> {
        let Some(embedder) = &self.providers.embedder else {
            return Ok(None);
        };
        let qv = match embedder.embed_batch(&[query.to_string()], EmbedRole::Query, cancel) {
            Ok(mut v) => v.pop().unwrap_or_default(),
            Err(err) if is_external(&err) => {
                warn!(error = %err, "query embedding failed, keyword channel only");
                degraded.push(format!("vector: {err}"));
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let tag = embedder.model_tag();
        let hits = self
            .repo
            .read(|conn| vectors::vector_knn(conn, &qv, depth, &tag, filters))?;
        Ok(Some(hits))
    }

    fn run(&self, query: &str, opts: &SearchOptions, out: Option<&mut dyn Write>) -> Result<SearchResponse> {
        opts.cancel.check()?;
        let filters = opts.filters();
        let depth = opts.candidate_limit();
        let mut response = SearchResponse::default();

        let mut vec_degraded = Vec::new();
        let (fts_hits, vec_hits) = if opts.disable_vector {
            (self.fts_channel(query, &filters, depth), Ok(None))
        } else {
            rayon::join(
                || self.fts_channel(query, &filters, depth),
                || self.vector_channel(query, &filters, depth, &opts.cancel, &mut vec_degraded),
            )
        };
        let fts_hits = fts_hits?;
        let vec_hits = vec_hits?.unwrap_or_default();
        response.degraded.extend(vec_degraded);
        opts.cancel.check()?;

        let (mut fused, mut source) = fusion::fuse(&fts_hits, &vec_hits, &self.weights());
        let docs = self.load_docs(&fused)?;
        // a node deleted between channel reads has no doc; drop it
        fused.retain(|f| docs.contains_key(&f.node_id));
        let updated: HashMap<String, i64> = docs.iter().map(|(id, d)| (id.clone(), d.updated_at)).collect();
        fusion::sort_fused(&mut fused, &updated);
        debug!(fts = fts_hits.len(), vector = vec_hits.len(), fused = fused.len(), "channels fused");

        if (opts.use_reranker || self.config.rerank) && !fused.is_empty() {
            if let Some(reranked) = self.rerank(query, &mut fused, &docs, opts, &mut response.degraded)? {
                source = reranked;
            }
        }

        fused.truncate(opts.limit);
        response.results = fused
            .into_iter()
            .filter_map(|f| docs.get(&f.node_id).map(|d| to_result(f, d, source)))
            .collect();

        if opts.generate_answer {
            self.answer(query, opts, out, &mut response)?;
        }
        Ok(response)
    }

    fn load_docs(&self, fused: &[Fused]) -> Result<HashMap<String, NodeDoc>> {
        self.repo.read(|conn| {
            let mut out = HashMap::new();
            for f in fused {
                if let Some(doc) = fts::get_doc(conn, &f.node_id)? {
                    out.insert(f.node_id.clone(), doc);
                }
            }
            Ok(out)
        })
    }

    fn rerank(
        &self,
        query: &str,
        fused: &mut Vec<Fused>,
        docs: &HashMap<String, NodeDoc>,
        opts: &SearchOptions,
        degraded: &mut Vec<String>,
    ) -> Result<Option<ResultSource>> {
        let Some(reranker) = &self.providers.reranker else {
            return Ok(None);
        };
        let head_len = (2 * opts.limit).min(fused.len());
        let texts: Vec<String> = fused[..head_len]
            .iter()
            .map(|f| docs.get(&f.node_id).map(NodeDoc::embed_text).unwrap_or_default())
            .collect();
        match reranker.rerank(query, &texts, &opts.cancel) {
            Ok(scores) if scores.len() == head_len => {
                let mut head: Vec<Fused> = fused.drain(..head_len).collect();
                fusion::apply_rerank(&mut head, &scores);
                head.append(fused);
                *fused = head;
                Ok(Some(ResultSource::Reranked))
            }
            Ok(scores) => {
                degraded.push(format!("rerank: expected {head_len} scores, got {}", scores.len()));
                Ok(None)
            }
            Err(err) if is_external(&err) => {
                warn!(error = %err, "rerank failed, keeping fused order");
                degraded.push(format!("rerank: {err}"));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn answer(
        &self,
        query: &str,
        opts: &SearchOptions,
        out: Option<&mut dyn Write>,
        response: &mut SearchResponse,
    ) -> Result<()> {
        let Some(chat) = &self.providers.chat else {
            response.answer_unavailable = true;
            return Ok(());
        };
        match answer::synthesize(
            chat.as_ref(),
            query,
            &response.results,
            self.config.answer_char_budget,
            out,
            &opts.cancel,
        ) {
            Ok(a) => response.answer = Some(a),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) if is_external(&err) => {
                warn!(error = %err, "answer synthesis failed");
                response.answer_unavailable = true;
                response.degraded.push(format!("answer: {err}"));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

fn to_result(f: Fused, doc: &NodeDoc, source: ResultSource) -> ResultNode {
    let snippet = f.snippet.or_else(|| fts::fallback_snippet(doc, SNIPPET_CHARS));
    ResultNode {
        node_id: f.node_id,
        node_type: doc.node_type,
        title: doc.title.clone(),
        summary: doc.summary.clone(),
        score: f.score,
        source,
        snippet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fts::index_doc;
    use crate::memory::model::Verification;
    use crate::memory::testutil::{repo, WS};
    use crate::providers::fakes::{FailingChat, FailingReranker, KeywordReranker, ScriptedChat};
    use crate::providers::local::LocalEmbedder;
    use std::sync::Arc;

    fn doc(id: &str, node_type: NodeType, title: &str, body: &str) -> NodeDoc {
        NodeDoc {
            node_id: id.into(),
            workspace_id: WS.into(),
            node_type,
            title: title.into(),
            summary: body.lines().next().unwrap_or_default().into(),
            body: body.into(),
            verification: Verification::Unchecked,
            updated_at: 1,
        }
    }

    fn seeded() -> (tempfile::TempDir, Repo) {
        let (tmp, repo, _) = repo();
        let embedder = LocalEmbedder::default();
        let docs = vec![
            doc("n-auth0001", NodeType::Feature, "Auth", "JWT auth for the API"),
            doc("n-jwt00001", NodeType::Decision, "Use JWT", "stateless tokens, no session store"),
            doc("n-sqlite01", NodeType::Decision, "Use SQLite", "single file embedded database"),
            doc("n-sym00001", NodeType::Symbol, "verify_jwt", "fn verify_jwt(token: &str)"),
        ];
        repo.write(|tx| {
            for d in &docs {
                index_doc(tx, d)?;
                vectors::put_vector(tx, &d.node_id, "local-hash-256-v1", &embedder.embed_one(&d.embed_text()))?;
            }
            Ok(())
        })
        .unwrap();
        (tmp, repo)
    }

    fn local() -> Providers {
        Providers::none().with_embedder(Arc::new(LocalEmbedder::default()))
    }

    #[test]
    fn hybrid_search_fuses_both_channels() {
        let (_tmp, repo) = seeded();
        let providers = local();
        let cfg = RetrievalConfig::default();
        let resp = Retriever::new(&repo, &providers, &cfg)
            .search("jwt stateless", &SearchOptions::new(WS, 3))
            .unwrap();
        assert!(!resp.results.is_empty());
        assert_eq!(resp.results[0].source, ResultSource::Fused);
        assert!(["n-auth0001", "n-jwt00001"].contains(&resp.results[0].node_id.as_str()));
        assert!(resp.results.iter().all(|r| r.node_type != NodeType::Symbol));
    }

    #[test]
    fn vector_disabled_matches_keyword_search() {
        let (_tmp, repo) = seeded();
        let providers = local();
        let cfg = RetrievalConfig::default();
        let mut opts = SearchOptions::new(WS, 10);
        opts.disable_vector = true;
        let resp = Retriever::new(&repo, &providers, &cfg).search("jwt", &opts).unwrap();
        let mut got: Vec<String> = resp.results.iter().map(|r| r.node_id.clone()).collect();
        let mut want: Vec<String> = repo
            .read(|c| fts::fts_search(c, "jwt", &opts.filters(), 10))
            .unwrap()
            .into_iter()
            .map(|h| h.node_id)
            .collect();
        got.sort();
        want.sort();
        assert_eq!(got, want);
        assert!(resp.results.iter().all(|r| r.source == ResultSource::Fts));
    }

    #[test]
    fn rerank_failure_keeps_fused_order() {
        let (_tmp, repo) = seeded();
        let cfg = RetrievalConfig::default();
        let mut opts = SearchOptions::new(WS, 3);
        opts.use_reranker = true;

        let good = local().with_reranker(Arc::new(KeywordReranker { favour: "SQLite".into() }));
        let resp = Retriever::new(&repo, &good, &cfg).search("use", &opts).unwrap();
        assert_eq!(resp.results[0].node_id, "n-sqlite01");
        assert_eq!(resp.results[0].source, ResultSource::Reranked);

        let bad = local().with_reranker(Arc::new(FailingReranker));
        let resp = Retriever::new(&repo, &bad, &cfg).search("use", &opts).unwrap();
        assert!(resp.results.iter().all(|r| r.source != ResultSource::Reranked));
        assert_eq!(resp.degraded.len(), 1);
    }

    #[test]
    fn answer_is_cited_or_flagged_unavailable() {
        let (_tmp, repo) = seeded();
        let cfg = RetrievalConfig::default();
        let mut opts = SearchOptions::new(WS, 3);
        opts.generate_answer = true;

        let chat = local().with_chat(Arc::new(ScriptedChat::new("Stateless tokens [n-jwt00001].")));
        let resp = Retriever::new(&repo, &chat, &cfg).search("jwt stateless", &opts).unwrap();
        let answer = resp.answer.unwrap();
        assert_eq!(answer.citations, vec!["n-jwt00001"]);

        let down = local().with_chat(Arc::new(FailingChat));
        let resp = Retriever::new(&repo, &down, &cfg).search("jwt", &opts).unwrap();
        assert!(resp.answer.is_none());
        assert!(resp.answer_unavailable);
        assert!(!resp.results.is_empty());
    }

    #[test]
    fn empty_query_returns_nothing() {
        let (_tmp, repo) = seeded();
        let providers = Providers::none();
        let cfg = RetrievalConfig::default();
        let resp = Retriever::new(&repo, &providers, &cfg)
            .search("the of", &SearchOptions::new(WS, 5))
            .unwrap();
        assert!(resp.results.is_empty());
    }
}
