use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the workspace root that holds config and memory.
pub const TASKWING_DIR: &str = ".taskwing";
const MEMORY_DIR_ENV: &str = "TASKWING_MEMORY_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Absolute or root-relative memory dir (default `.taskwing/memory`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Symbols unseen for this many days are garbage-collected.
    pub symbol_gc_grace_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            symbol_gc_grace_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit: usize,
    pub rrf_k: f64,
    pub fts_weight: f64,
    pub vector_weight: f64,
    pub rerank: bool,
    pub answer_char_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            rrf_k: 60.0,
            fts_weight: 1.0,
            vector_weight: 1.0,
            rerank: false,
            answer_char_budget: 6000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// 0 means one worker per CPU.
    pub workers: usize,
    pub verify_evidence: bool,
    pub max_file_bytes: u64,
    pub event_buffer: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            verify_evidence: true,
            max_file_bytes: 512 * 1024,
            event_buffer: 1024,
        }
    }
}

impl AgentsConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub max_tasks: u32,
    pub max_minutes: u32,
    pub recall_k: usize,
    /// Upper bound on the context injected with each task.
    pub context_chars: usize,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            max_minutes: 30,
            recall_k: 5,
            context_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    None,
    Local,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub embedder: EmbedderKind,
    /// Chat model for answer synthesis; empty disables answers.
    pub chat_model: String,
    /// Reranker model; empty disables reranking.
    pub rerank_model: String,
    pub ollama_host: String,
    pub embed_model: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            embedder: EmbedderKind::Local,
            chat_model: String::new(),
            rerank_model: String::new(),
            ollama_host: "http://127.0.0.1:11434".into(),
            embed_model: "nomic-embed-text".into(),
            timeout_secs: 30,
            retry_attempts: 3,
        }
    }
}

impl Config {
    /// Project config first, then the user config dir, then defaults.
    pub fn load(root: &Path) -> Result<Self> {
        for path in config_candidates(root) {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Config::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Resolved memory directory for a workspace root.
    pub fn memory_dir(&self, root: &Path) -> PathBuf {
        if let Ok(dir) = std::env::var(MEMORY_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        match &self.memory.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => root.join(TASKWING_DIR).join("memory"),
        }
    }
}

fn config_candidates(root: &Path) -> Vec<PathBuf> {
    let mut out = vec![root.join(TASKWING_DIR).join("config.toml")];
    if let Some(dir) = dirs::config_dir() {
        out.push(dir.join("taskwing").join("config.toml"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hook_defaults_match_circuit_breaker() {
        let cfg = Config::default();
        assert_eq!(cfg.hooks.max_tasks, 5);
        assert_eq!(cfg.hooks.max_minutes, 30);
        assert_eq!(cfg.retrieval.rrf_k, 60.0);
        assert_eq!(cfg.memory.symbol_gc_grace_days, 7);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: Config = toml::from_str(
            "[hooks]\nmax_tasks = 2\n\n[providers]\nembedder = \"none\"\n",
        )
        .unwrap();
        assert_eq!(cfg.hooks.max_tasks, 2);
        assert_eq!(cfg.hooks.recall_k, 5);
        assert_eq!(cfg.providers.embedder, EmbedderKind::None);
        assert_eq!(cfg.providers.timeout_secs, 30);
    }

    #[test]
    fn project_config_wins() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(TASKWING_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "[retrieval]\nlimit = 3\n").unwrap();
        let cfg = Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.retrieval.limit, 3);
    }

    #[test]
    fn relative_memory_path_resolves_against_root() {
        let mut cfg = Config::default();
        cfg.memory.path = Some(PathBuf::from("mem"));
        if std::env::var(MEMORY_DIR_ENV).is_err() {
            assert_eq!(cfg.memory_dir(Path::new("/w")), PathBuf::from("/w/mem"));
        }
    }

    #[test]
    fn bad_toml_is_a_validation_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[hooks\nmax_tasks = ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert_eq!(crate::error::classify(&err), crate::error::ErrorKind::Validation);
    }
}
