use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use docqa_core::{ChunkConfig, DocIdStrategy};
use docqa_llm::LlmConfig;

use crate::context::{DEFAULT_MAX_CONTEXT_CHARS, MIN_CONTEXT_CHARS};
use crate::embedding::EmbeddingConfig;
use crate::reranker::RerankerConfig;
use crate::store::Distance;

pub const DEFAULT_CONFIG_FILE: &str = "docqa.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocQaConfig {
    pub index: IndexConfig,
    pub documents: DocumentsConfig,
    pub chunking: ChunkConfig,
    pub embedding: EmbeddingConfig,
    pub reranker: RerankerConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub path: PathBuf,
    pub collection: String,
    pub distance: Distance,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/docqa.sqlite"),
            collection: "local_docs".to_string(),
            distance: Distance::Cosine,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    pub dir: PathBuf,
    pub id_strategy: DocIdStrategy,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("documents"),
            id_strategy: DocIdStrategy::Filename,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Vector search depth before reranking.
    pub candidates: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub check_evidence: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidates: 25,
            top_k: 5,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            check_evidence: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

impl DocQaConfig {
    /// Reads the config file (explicit path, `DOCQA_CONFIG`, or `docqa.toml`
    /// in the working directory when present), then applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("DOCQA_CONFIG").ok().map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DOCQA_INDEX_PATH") {
            self.index.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("DOCQA_DOCUMENTS_DIR") {
            self.documents.dir = PathBuf::from(dir);
        }
        if let Some(collection) = lookup("DOCQA_COLLECTION") {
            self.index.collection = collection;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(provider) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse()?;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = Some(model);
        }
        if let Some(url) = lookup("EMBEDDING_URL") {
            self.embedding.url = Some(url);
        }
        if let Some(dims) = lookup("EMBEDDING_DIMENSIONS") {
            self.embedding.dimensions = dims
                .parse()
                .map_err(|_| anyhow!("EMBEDDING_DIMENSIONS must be an integer, got '{dims}'"))?;
        }
        if let Some(provider) = lookup("RERANKER_PROVIDER") {
            if matches!(provider.trim().to_lowercase().as_str(), "none" | "off") {
                self.reranker.enabled = false;
            } else {
                self.reranker.provider = provider.parse()?;
                self.reranker.enabled = true;
            }
        }
        if let Some(url) = lookup("RERANKER_URL") {
            self.reranker.url = Some(url);
        }
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking
            .validate()
            .map_err(|e| anyhow!(e.to_string()))?;
        if self.embedding.dimensions == 0 {
            return Err(anyhow!("embedding.dimensions must be at least 1"));
        }
        if self.retrieval.top_k == 0 {
            return Err(anyhow!("retrieval.top_k must be at least 1"));
        }
        if self.retrieval.candidates < self.retrieval.top_k {
            return Err(anyhow!(
                "retrieval.candidates ({}) must be >= retrieval.top_k ({})",
                self.retrieval.candidates,
                self.retrieval.top_k
            ));
        }
        if self.retrieval.max_context_chars < MIN_CONTEXT_CHARS {
            return Err(anyhow!(
                "retrieval.max_context_chars must be at least {MIN_CONTEXT_CHARS}"
            ));
        }
        if self.index.collection.trim().is_empty() {
            return Err(anyhow!("index.collection must not be empty"));
        }
        Ok(())
    }

    /// Sample file written by `docqa init`.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_core::ChunkPolicy;
    use docqa_llm::LlmProvider;
    use std::collections::HashMap;

    use crate::embedding::EmbeddingProvider;

    #[test]
    fn defaults_match_documented_values() {
        let config = DocQaConfig::default();
        assert_eq!(config.index.collection, "local_docs");
        assert_eq!(config.retrieval.candidates, 25);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.chunking.window_pages, 2);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DocQaConfig::from_toml_str(
            r#"
            [chunking]
            policy = "semantic"

            [embedding]
            provider = "ollama"
            model = "bge-large"
            dimensions = 1024

            [llm]
            provider = "local"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.policy, ChunkPolicy::Semantic);
        assert_eq!(config.chunking.breakpoint_percentile, 95.0);
        assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.llm.provider, LlmProvider::Local);
        assert_eq!(config.index.collection, "local_docs");
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("DOCQA_COLLECTION", "manuals"),
            ("LLM_PROVIDER", "openai"),
            ("EMBEDDING_DIMENSIONS", "768"),
            ("RERANKER_PROVIDER", "none"),
        ]
        .into_iter()
        .collect();
        let mut config = DocQaConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.index.collection, "manuals");
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.embedding.dimensions, 768);
        assert!(!config.reranker.enabled);
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut config = DocQaConfig::default();
        assert!(config
            .apply_overrides(|key| (key == "EMBEDDING_DIMENSIONS").then(|| "wide".to_string()))
            .is_err());
    }

    #[test]
    fn validation_rejects_inconsistent_retrieval() {
        let mut config = DocQaConfig::default();
        config.retrieval.candidates = 3;
        assert!(config.validate().is_err());
        let mut config = DocQaConfig::default();
        config.chunking.window_pages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_context_budget_below_tag_overhead() {
        let mut config = DocQaConfig::default();
        config.retrieval.max_context_chars = 10;
        assert!(config.validate().is_err());
        config.retrieval.max_context_chars = MIN_CONTEXT_CHARS;
        config.validate().unwrap();
    }

    #[test]
    fn serialized_config_round_trips() {
        let text = DocQaConfig::default().to_toml_string().unwrap();
        let parsed = DocQaConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.server.bind_addr, "127.0.0.1:8000");
    }
}
