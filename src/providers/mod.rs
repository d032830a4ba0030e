//! Capabilities the core consumes from the outside world: embedder, chat
//! model, reranker and file access. Everything is injected; tests pass fakes.

pub mod http;
pub mod local;
pub mod ollama;
pub mod retry;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::{EmbedderKind, ProvidersConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Document,
    Query,
}

pub trait Embedder: Send + Sync {
    /// Identifies the vector space; vectors are recomputed when it changes.
    fn model_tag(&self) -> String;

    fn embed_batch(&self, texts: &[String], role: EmbedRole, cancel: &CancelToken) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

pub trait ChatClient: Send + Sync {
    /// Returns the full reply; `on_token` sees each fragment as it arrives.
    fn chat(
        &self,
        messages: &[ChatMessage],
        on_token: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<String>;
}

pub trait Reranker: Send + Sync {
    /// One relevance score per document, same order as `docs`.
    fn rerank(&self, query: &str, docs: &[String], cancel: &CancelToken) -> Result<Vec<f32>>;
}

/// Read access to workspace files, relative to a root.
pub trait FileSource: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    fn read_to_string(&self, rel_path: &str) -> Result<Option<String>>;
}

pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl FileSource for FsSource {
    fn read_to_string(&self, rel_path: &str) -> Result<Option<String>> {
        let path = self.root.join(rel_path);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

/// The configured set of external capabilities.
#[derive(Clone, Default)]
pub struct Providers {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub chat: Option<Arc<dyn ChatClient>>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl Providers {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn from_config(cfg: &ProvidersConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let policy = retry::RetryPolicy::with_attempts(cfg.retry_attempts);
        let mut out = Self::none();
        match cfg.embedder {
            EmbedderKind::None => {}
            EmbedderKind::Local => out.embedder = Some(Arc::new(local::LocalEmbedder::default())),
            EmbedderKind::Ollama => {
                out.embedder = Some(Arc::new(ollama::OllamaEmbedder::new(
                    &cfg.ollama_host,
                    &cfg.embed_model,
                    timeout,
                    policy.clone(),
                )?))
            }
        }
        if !cfg.chat_model.trim().is_empty() {
            out.chat = Some(Arc::new(ollama::OllamaChat::new(
                &cfg.ollama_host,
                &cfg.chat_model,
                timeout,
                policy.clone(),
            )?));
        }
        if !cfg.rerank_model.trim().is_empty() {
            out.reranker = Some(Arc::new(ollama::OllamaReranker::new(
                &cfg.ollama_host,
                &cfg.rerank_model,
                timeout,
                policy,
            )?));
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fs_source_reports_missing_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "hi").unwrap();
        let src = FsSource::new(tmp.path());
        assert_eq!(src.read_to_string("a.txt").unwrap().as_deref(), Some("hi"));
        assert!(src.read_to_string("b.txt").unwrap().is_none());
    }

    #[test]
    fn config_selects_providers() {
        let mut cfg = ProvidersConfig::default();
        cfg.embedder = EmbedderKind::None;
        let p = Providers::from_config(&cfg).unwrap();
        assert!(p.embedder.is_none() && p.chat.is_none() && p.reranker.is_none());

        cfg.embedder = EmbedderKind::Local;
        cfg.chat_model = "llama3.2".into();
        let p = Providers::from_config(&cfg).unwrap();
        assert!(p.embedder.is_some() && p.chat.is_some());
    }
}
