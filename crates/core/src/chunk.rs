use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::document::{DocumentRecord, PageText};
use crate::embedding::Embedder;
use crate::error::{CoreError, Result};
use crate::extract::clean_page_text;
use crate::semantic::split_semantic;

const CHUNK_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// Fixed windows of consecutive pages.
    #[default]
    Window,
    /// Sentence groups cut where the topic shifts.
    Semantic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub policy: ChunkPolicy,
    pub window_pages: usize,
    pub min_page_chars: usize,
    pub buffer_size: usize,
    pub breakpoint_percentile: f32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            policy: ChunkPolicy::Window,
            window_pages: 2,
            min_page_chars: 20,
            buffer_size: 1,
            breakpoint_percentile: 95.0,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_pages == 0 {
            return Err(CoreError::InvalidConfig(
                "window_pages must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.breakpoint_percentile) {
            return Err(CoreError::InvalidConfig(format!(
                "breakpoint_percentile must be within 0..=100, got {}",
                self.breakpoint_percentile
            )));
        }
        Ok(())
    }
}

/// A retrievable unit of document text with page provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub doc_name: String,
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
}

impl Chunk {
    pub fn is_single_page(&self) -> bool {
        self.page_start == self.page_end
    }

    pub fn covers_page(&self, page: u32) -> bool {
        (self.page_start..=self.page_end).contains(&page)
    }
}

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Cleans the pages, drops the ones below the noise threshold and groups
    /// the rest according to the configured policy.
    ///
    /// The embedder is only consulted by the semantic policy.
    pub fn chunk_document(
        &self,
        document: &DocumentRecord,
        pages: &[PageText],
        embedder: &dyn Embedder,
    ) -> Result<Vec<Chunk>> {
        let kept = self.filter_pages(pages);
        debug!(
            doc_id = %document.doc_id,
            pages = pages.len(),
            kept = kept.len(),
            "filtered pages"
        );
        if kept.is_empty() {
            return Ok(Vec::new());
        }
        match self.config.policy {
            ChunkPolicy::Window => Ok(self.chunk_by_window(document, &kept)),
            ChunkPolicy::Semantic => self.chunk_semantic(document, &kept, embedder),
        }
    }

    pub fn filter_pages(&self, pages: &[PageText]) -> Vec<PageText> {
        pages
            .iter()
            .map(|page| PageText::new(page.number, clean_page_text(&page.text)))
            .filter(|page| page.text.chars().count() >= self.config.min_page_chars)
            .collect()
    }

    fn chunk_by_window(&self, document: &DocumentRecord, kept: &[PageText]) -> Vec<Chunk> {
        let window = self.config.window_pages.max(1) as u32;
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<&PageText> = Vec::new();
        let mut current_window = None;
        for page in kept {
            let slot = (page.number.saturating_sub(1)) / window;
            if current_window != Some(slot) && !current.is_empty() {
                chunks.push(self.window_chunk(document, chunks.len(), &current));
                current.clear();
            }
            current_window = Some(slot);
            current.push(page);
        }
        if !current.is_empty() {
            chunks.push(self.window_chunk(document, chunks.len(), &current));
        }
        chunks
    }

    fn window_chunk(&self, document: &DocumentRecord, index: usize, pages: &[&PageText]) -> Chunk {
        let page_start = pages.first().map(|p| p.number).unwrap_or(1);
        let page_end = pages.last().map(|p| p.number).unwrap_or(page_start);
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.build_chunk(document, index, page_start, page_end, text)
    }

    fn chunk_semantic(
        &self,
        document: &DocumentRecord,
        kept: &[PageText],
        embedder: &dyn Embedder,
    ) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for page in kept {
            let groups = split_semantic(
                &page.text,
                self.config.buffer_size,
                self.config.breakpoint_percentile,
                embedder,
            )?;
            for text in groups {
                if text.trim().is_empty() {
                    continue;
                }
                let index = chunks.len();
                chunks.push(self.build_chunk(document, index, page.number, page.number, text));
            }
        }
        Ok(chunks)
    }

    fn build_chunk(
        &self,
        document: &DocumentRecord,
        index: usize,
        page_start: u32,
        page_end: u32,
        text: String,
    ) -> Chunk {
        Chunk {
            chunk_id: stable_chunk_id(
                &document.doc_id,
                index,
                page_start,
                page_end,
                self.config.policy,
                CHUNK_VERSION,
            ),
            doc_id: document.doc_id.clone(),
            doc_name: document.doc_name.clone(),
            text,
            page_start,
            page_end,
        }
    }
}

fn stable_chunk_id(
    doc_id: &str,
    chunk_index: usize,
    page_start: u32,
    page_end: u32,
    policy: ChunkPolicy,
    version: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(version.to_be_bytes());
    hasher.update(policy_discriminant(policy).to_be_bytes());
    hasher.update((chunk_index as u64).to_be_bytes());
    hasher.update(page_start.to_be_bytes());
    hasher.update(page_end.to_be_bytes());
    hex::encode(hasher.finalize())
}

fn policy_discriminant(policy: ChunkPolicy) -> u32 {
    match policy {
        ChunkPolicy::Window => 0,
        ChunkPolicy::Semantic => 1,
    }
}
