//! In-process feature-hashing embedder. Deterministic, offline, and good
//! enough to pull near-duplicates and shared vocabulary together.

use anyhow::Result;
use xxhash_rust::xxh3::xxh3_64;

use super::{EmbedRole, Embedder};
use crate::cancel::CancelToken;
use crate::memory::vectors::l2_normalize;

pub const LOCAL_DIM: usize = 256;
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.35;

#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dim: usize,
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self { dim: LOCAL_DIM }
    }
}

impl LocalEmbedder {
    pub fn with_dim(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn add(&self, out: &mut [f32], feature: &str, weight: f32) {
        let h = xxh3_64(feature.as_bytes());
        let idx = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
        out[idx] += sign * weight;
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 1)
        {
            self.add(&mut out, word, WORD_WEIGHT);
            let chars: Vec<char> = format!("#{word}#").chars().collect();
            for tri in chars.windows(3) {
                let gram: String = tri.iter().collect();
                self.add(&mut out, &gram, TRIGRAM_WEIGHT);
            }
        }
        l2_normalize(&mut out);
        out
    }
}

impl Embedder for LocalEmbedder {
    fn model_tag(&self) -> String {
        format!("local-hash-{}-v1", self.dim)
    }

    fn embed_batch(&self, texts: &[String], _role: EmbedRole, cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            cancel.check()?;
            out.push(self.embed_one(text));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vectors::dot;

    #[test]
    fn deterministic_and_unit_length() {
        let e = LocalEmbedder::default();
        let a = e.embed_one("JWT auth tokens");
        let b = e.embed_one("JWT auth tokens");
        assert_eq!(a, b);
        assert_eq!(a.len(), LOCAL_DIM);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
        assert_eq!(e.model_tag(), "local-hash-256-v1");
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = LocalEmbedder::default();
        let q = e.embed_one("jwt stateless");
        let near = e.embed_one("Use JWT because it is stateless");
        let far = e.embed_one("Render charts with canvas");
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = LocalEmbedder::default().embed_one("  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
