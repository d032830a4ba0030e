//! Channel fusion. Deterministic given the same channel outputs.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::memory::model::NodeHit;

/// Channel weights and the RRF damping constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub fts: f64,
    pub vector: f64,
    pub k: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            fts: 1.0,
            vector: 1.0,
            k: 60.0,
        }
    }
}

/// Which channels contributed to a fused list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Fts,
    Vector,
    Fused,
    Reranked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub node_id: String,
    pub score: f64,
    /// Raw FTS score; first tie-break.
    pub fts_score: Option<f64>,
    /// Min-max normalised channel scores.
    pub fts_norm: Option<f64>,
    pub vector_norm: Option<f64>,
    pub snippet: Option<String>,
}

/// Rescale scores into [0, 1] over the set. A flat set maps to 1.0.
pub fn min_max(hits: &[NodeHit]) -> Vec<f64> {
    let (lo, hi) = hits.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), h| {
        (lo.min(h.score), hi.max(h.score))
    });
    let span = hi - lo;
    hits.iter()
        .map(|h| if span > f64::EPSILON { (h.score - lo) / span } else { 1.0 })
        .collect()
}

/// Reciprocal rank fusion over two ranked channels (best first, 1-based
/// rank). With one empty channel the other passes through on its
/// normalised score.
pub fn fuse(fts: &[NodeHit], vector: &[NodeHit], w: &FusionWeights) -> (Vec<Fused>, ResultSource) {
    let source = match (fts.is_empty(), vector.is_empty()) {
        (false, true) => ResultSource::Fts,
        (true, false) => ResultSource::Vector,
        _ => ResultSource::Fused,
    };
    let mut by_id: HashMap<&str, Fused> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    let fts_norm = min_max(fts);
    for (rank, (hit, norm)) in fts.iter().zip(&fts_norm).enumerate() {
        if !by_id.contains_key(hit.node_id.as_str()) {
            order.push(hit.node_id.as_str());
        }
        let f = by_id.entry(hit.node_id.as_str()).or_insert_with(|| blank(&hit.node_id));
        if f.fts_score.is_some() {
            continue;
        }
        f.fts_score = Some(hit.score);
        f.fts_norm = Some(*norm);
        f.snippet = hit.snippet.clone();
        f.score += match source {
            ResultSource::Fts => *norm,
            _ => w.fts / (w.k + (rank + 1) as f64),
        };
    }

    let vec_norm = min_max(vector);
    for (rank, (hit, norm)) in vector.iter().zip(&vec_norm).enumerate() {
        if !by_id.contains_key(hit.node_id.as_str()) {
            order.push(hit.node_id.as_str());
        }
        let f = by_id.entry(hit.node_id.as_str()).or_insert_with(|| blank(&hit.node_id));
        if f.vector_norm.is_some() {
            continue;
        }
        f.vector_norm = Some(*norm);
        f.score += match source {
            ResultSource::Vector => *norm,
            _ => w.vector / (w.k + (rank + 1) as f64),
        };
    }

    let fused = order
        .into_iter()
        .filter_map(|id| by_id.remove(id))
        .collect();
    (fused, source)
}

fn blank(id: &str) -> Fused {
    Fused {
        node_id: id.to_string(),
        score: 0.0,
        fts_score: None,
        fts_norm: None,
        vector_norm: None,
        snippet: None,
    }
}

/// Score desc, then raw FTS score desc, then newer `updated_at`, then id asc.
pub fn sort_fused(fused: &mut [Fused], updated_at: &HashMap<String, i64>) {
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let fa = a.fts_score.unwrap_or(f64::NEG_INFINITY);
                let fb = b.fts_score.unwrap_or(f64::NEG_INFINITY);
                fb.partial_cmp(&fa).unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                let ua = updated_at.get(&a.node_id).copied().unwrap_or(i64::MIN);
                let ub = updated_at.get(&b.node_id).copied().unwrap_or(i64::MIN);
                ub.cmp(&ua)
            })
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

/// Reorder the head by reranker relevance; prior order breaks ties.
pub fn apply_rerank(head: &mut Vec<Fused>, scores: &[f32]) {
    let mut scored: Vec<(usize, f32, Fused)> = head
        .drain(..)
        .zip(scores.iter().copied())
        .enumerate()
        .map(|(i, (f, s))| (i, s, f))
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    head.extend(scored.into_iter().map(|(_, s, mut f)| {
        f.score = f64::from(s);
        f
    }));
}
