use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{debug, info};

use docqa_core::{Embedder, HashEmbedder, HashEmbedderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Hash,
    OpenAi,
    Ollama,
}

impl FromStr for EmbeddingProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "hash" => Ok(EmbeddingProvider::Hash),
            "openai" => Ok(EmbeddingProvider::OpenAi),
            "ollama" => Ok(EmbeddingProvider::Ollama),
            other => Err(anyhow!("unknown embedding provider '{other}'")),
        }
    }
}

/// `[embedding]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: Option<String>,
    pub url: Option<String>,
    pub dimensions: usize,
    /// Prepended to queries only, e.g. the BGE retrieval instruction.
    pub query_prefix: Option<String>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            model: None,
            url: None,
            dimensions: 384,
            query_prefix: None,
            batch_size: 32,
        }
    }
}

impl EmbeddingConfig {
    pub fn model_name(&self) -> &str {
        if let Some(model) = self.model.as_deref() {
            return model;
        }
        match self.provider {
            EmbeddingProvider::Hash => "hash",
            EmbeddingProvider::OpenAi => "text-embedding-3-small",
            EmbeddingProvider::Ollama => "bge-large",
        }
    }
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
    Ollama(OllamaEmbeddingClient),
}

/// [`Embedder`] over one of the configured backends.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    dimensions: usize,
    query_prefix: Option<String>,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let backend = match config.provider {
            EmbeddingProvider::Hash => EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                dimensions: config.dimensions,
                seed: 1337,
            })),
            EmbeddingProvider::OpenAi => {
                let base_url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(config.model_name(), &base_url)?)
            }
            EmbeddingProvider::Ollama => {
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                EmbeddingBackend::Ollama(OllamaEmbeddingClient::new(config.model_name(), &url))
            }
        };
        Ok(Self {
            backend,
            dimensions: config.dimensions,
            query_prefix: config.query_prefix.clone().filter(|p| !p.is_empty()),
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
            dimensions: HashEmbedderConfig::default().dimensions,
            query_prefix: None,
            batch_size: 32,
        }
    }

    /// Embeds a sample text and checks the backend's output width against
    /// the configured dimension.
    pub fn warm_up(&self) -> Result<()> {
        let sample = self.embed_batch(&["warm up".to_string()])?;
        let actual = sample.first().map(|v| v.len()).unwrap_or(0);
        if actual != self.dimensions {
            return Err(anyhow!(
                "embedding backend returned {actual} dimensions, configured {}",
                self.dimensions
            ));
        }
        info!(dimensions = actual, "embedding backend ready");
        Ok(())
    }

    fn embed_chunked(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            let vectors = match &self.backend {
                EmbeddingBackend::Hash(embedder) => {
                    batch.iter().map(|text| embedder.embed_text(text)).collect()
                }
                EmbeddingBackend::OpenAi(client) => client.embed_batch(batch)?,
                EmbeddingBackend::Ollama(client) => client.embed_batch(batch)?,
            };
            out.extend(vectors);
        }
        if out.len() != inputs.len() {
            return Err(anyhow!(
                "embedding backend returned {} vectors for {} inputs",
                out.len(),
                inputs.len()
            ));
        }
        Ok(out)
    }
}

impl Embedder for EmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = inputs.len(), "embedding batch");
        self.embed_chunked(inputs)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        match &self.query_prefix {
            Some(prefix) => self.embed(&format!("{prefix}{text}")),
            None => self.embed(text),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    base_url: String,
    api_key: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str, base_url: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY is required for openai embeddings"))?;
        Ok(Self {
            http: Client::new(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("openai embeddings request to {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "openai embeddings request failed: {}",
                response.status()
            ));
        }
        let mut parsed: OpenAiEmbeddingResponse = response.json()?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Clone)]
pub struct OllamaEmbeddingClient {
    http: Client,
    model: String,
    url: String,
}

impl OllamaEmbeddingClient {
    pub fn new(model: &str, url: &str) -> Self {
        Self {
            http: Client::new(),
            model: model.to_string(),
            url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.url);
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .with_context(|| format!("ollama connection error (is ollama running at {}?)", self.url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("ollama embed error {status}: {body}"));
        }
        let parsed: OllamaEmbeddingResponse = response.json()?;
        Ok(parsed.embeddings)
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_backend_warms_up_at_configured_width() {
        let client = EmbeddingClient::new(&EmbeddingConfig {
            dimensions: 64,
            ..Default::default()
        })
        .unwrap();
        client.warm_up().unwrap();
        assert_eq!(client.embed("pump").unwrap().len(), 64);
    }

    #[test]
    fn query_prefix_only_applies_to_queries() {
        let client = EmbeddingClient::new(&EmbeddingConfig {
            query_prefix: Some("Represent this sentence for searching: ".to_string()),
            ..Default::default()
        })
        .unwrap();
        let passage = client.embed("seed storage").unwrap();
        let query = client.embed_query("seed storage").unwrap();
        assert_ne!(passage, query);
        let plain = EmbeddingClient::hash();
        assert_eq!(plain.embed_query("seed storage").unwrap(), passage);
    }

    #[test]
    fn batches_preserve_order() {
        let client = EmbeddingClient::new(&EmbeddingConfig {
            batch_size: 2,
            ..Default::default()
        })
        .unwrap();
        let inputs: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let vectors = client.embed_batch(&inputs).unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[4], client.embed("e").unwrap());
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("Ollama".parse::<EmbeddingProvider>().unwrap(), EmbeddingProvider::Ollama);
        assert!("candle".parse::<EmbeddingProvider>().is_err());
    }
}
