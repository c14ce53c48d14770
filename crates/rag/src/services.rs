use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use docqa_core::{
    list_documents, Chunker, DocumentEntry, Embedder, FileExtractor, TextExtractor,
};
use docqa_llm::{Generator, LlmClient};

use crate::config::DocQaConfig;
use crate::embedding::EmbeddingClient;
use crate::filter::PayloadField;
use crate::reranker::{build_reranker, Reranker};
use crate::store::{SqliteIndex, VectorIndex};

/// Shared handles a [`ServiceContext`] is assembled from.
pub struct ServiceParts {
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub generator: Arc<dyn Generator>,
    pub index: Arc<dyn VectorIndex>,
}

/// Models, clients and the index handle, built once per process and shared
/// by every request.
pub struct ServiceContext {
    config: DocQaConfig,
    chunker: Chunker,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Arc<dyn Generator>,
    index: Arc<dyn VectorIndex>,
}

impl ServiceContext {
    /// Builds every backend from `config`. Fails when a backend cannot be
    /// built or the embedding width differs from the configured dimension.
    pub fn init(config: DocQaConfig) -> Result<Self> {
        config.validate()?;
        let embedder = EmbeddingClient::new(&config.embedding)
            .context("failed to build embedding client")?;
        embedder
            .warm_up()
            .context("embedding backend failed warm-up")?;
        let reranker = build_reranker(&config.reranker)?;
        let generator = LlmClient::new(&config.llm).context("failed to build llm client")?;
        let index = SqliteIndex::open(&config.index.path).with_context(|| {
            format!("failed to open index at {}", config.index.path.display())
        })?;
        info!(
            embedding = config.embedding.model_name(),
            llm_provider = %generator.provider(),
            llm_model = generator.model(),
            reranker = reranker.as_ref().map(|r| r.name()).unwrap_or("disabled"),
            index = %index.describe(),
            "service context initialised"
        );
        Self::from_parts(
            config,
            ServiceParts {
                extractor: Arc::new(FileExtractor),
                embedder: Arc::new(embedder),
                reranker,
                generator: Arc::new(generator),
                index: Arc::new(index),
            },
        )
    }

    /// Assembles a context from pre-built parts and prepares the collection.
    pub fn from_parts(config: DocQaConfig, parts: ServiceParts) -> Result<Self> {
        config.validate()?;
        parts.index.create_collection(
            &config.index.collection,
            parts.embedder.dimensions(),
            config.index.distance,
        )?;
        parts
            .index
            .ensure_payload_index(&config.index.collection, PayloadField::DocId)?;
        Ok(Self {
            chunker: Chunker::new(config.chunking),
            config,
            extractor: parts.extractor,
            embedder: parts.embedder,
            reranker: parts.reranker,
            generator: parts.generator,
            index: parts.index,
        })
    }

    pub fn config(&self) -> &DocQaConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.config.index.collection
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn extractor(&self) -> &dyn TextExtractor {
        self.extractor.as_ref()
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn reranker(&self) -> Option<&dyn Reranker> {
        self.reranker.as_deref()
    }

    pub fn generator(&self) -> &dyn Generator {
        self.generator.as_ref()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentEntry>> {
        Ok(list_documents(&self.config.documents.dir)?)
    }

    pub fn shutdown(self) {
        info!(collection = %self.config.index.collection, "service context shut down");
    }
}
