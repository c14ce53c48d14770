//! Second retrieval stage: re-scores the vector candidates against the query
//! and keeps the best few.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::store::SearchHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankerProvider {
    #[default]
    Lexical,
    Http,
}

impl FromStr for RerankerProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "lexical" => Ok(RerankerProvider::Lexical),
            "http" => Ok(RerankerProvider::Http),
            other => Err(anyhow!("unknown reranker provider '{other}'")),
        }
    }
}

/// `[reranker]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub provider: RerankerProvider,
    pub url: Option<String>,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: RerankerProvider::Lexical,
            url: None,
        }
    }
}

/// Scores `(query, passage)` pairs independently.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    /// Reorders `hits` by reranker score and keeps the best `top_k`. The
    /// result only ever contains members of `hits`.
    fn rerank(&self, query: &str, hits: Vec<SearchHit>, top_k: usize) -> Result<Vec<SearchHit>> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let passages: Vec<String> = hits.iter().map(|hit| hit.chunk.text.clone()).collect();
        let scores = self.score_batch(query, &passages)?;
        if scores.len() != hits.len() {
            return Err(anyhow!(
                "reranker returned {} scores for {} passages",
                scores.len(),
                hits.len()
            ));
        }
        let mut scored: Vec<SearchHit> = hits
            .into_iter()
            .zip(scores)
            .map(|(mut hit, score)| {
                hit.score = score;
                hit
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

pub fn build_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    if !config.enabled {
        return Ok(None);
    }
    let reranker: Arc<dyn Reranker> = match config.provider {
        RerankerProvider::Lexical => Arc::new(LexicalReranker::default()),
        RerankerProvider::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("reranker.url is required for the http reranker"))?;
            Arc::new(HttpReranker::new(url))
        }
    };
    Ok(Some(reranker))
}

/// BM25 over the candidate set with a bonus for passages containing the
/// whole query phrase.
#[derive(Debug, Clone)]
pub struct LexicalReranker {
    k1: f32,
    b: f32,
    phrase_bonus: f32,
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            phrase_bonus: 1.0,
        }
    }
}

impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        let docs: Vec<Vec<String>> = passages.iter().map(|p| tokenize(p)).collect();
        let n = docs.len() as f32;
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len()).sum::<usize>() as f32 / n
        };

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for doc in &docs {
            let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
            for term in unique {
                if query_terms.contains(term) {
                    *doc_freq.entry(term).or_default() += 1;
                }
            }
        }

        let phrase = tokenize(query).join(" ");
        let scores = docs
            .iter()
            .map(|doc| {
                let mut tf: HashMap<&str, usize> = HashMap::new();
                for term in doc {
                    if query_terms.contains(term.as_str()) {
                        *tf.entry(term.as_str()).or_default() += 1;
                    }
                }
                let len_norm = if avg_len > 0.0 {
                    doc.len() as f32 / avg_len
                } else {
                    0.0
                };
                let mut score = 0.0f32;
                for (term, freq) in tf {
                    let df = doc_freq.get(term).copied().unwrap_or(0) as f32;
                    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                    let freq = freq as f32;
                    score += idf * (freq * (self.k1 + 1.0))
                        / (freq + self.k1 * (1.0 - self.b + self.b * len_norm));
                }
                if !phrase.is_empty() && doc.join(" ").contains(&phrase) {
                    score += self.phrase_bonus;
                }
                score
            })
            .collect();
        Ok(scores)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Cross-encoder served over HTTP in the text-embeddings-inference shape.
#[derive(Clone)]
pub struct HttpReranker {
    http: Client,
    url: String,
}

impl HttpReranker {
    pub fn new(url: &str) -> Self {
        Self {
            http: Client::new(),
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/rerank", self.url);
        let payload = serde_json::json!({
            "query": query,
            "texts": passages,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .with_context(|| format!("rerank request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("reranker returned error (status {status}): {body}"));
        }
        let ranked: Vec<RerankScore> = response
            .json()
            .context("failed to decode reranker response")?;
        scores_by_index(ranked, passages.len())
    }
}

fn scores_by_index(ranked: Vec<RerankScore>, expected: usize) -> Result<Vec<f32>> {
    let mut scores = vec![None; expected];
    for item in ranked {
        let slot = scores
            .get_mut(item.index)
            .ok_or_else(|| anyhow!("reranker returned out-of-range index {}", item.index))?;
        *slot = Some(item.score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(idx, score)| score.ok_or_else(|| anyhow!("reranker skipped passage {idx}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_core::Chunk;

    fn hit(id: &str, text: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk: Chunk {
                chunk_id: id.to_string(),
                doc_id: "doc".to_string(),
                doc_name: "doc.pdf".to_string(),
                text: text.to_string(),
                page_start: 1,
                page_end: 1,
            },
            score,
        }
    }

    #[test]
    fn lexical_prefers_matching_passages() {
        let hits = vec![
            hit("a", "Solar panels should face south.", 0.9),
            hit("b", "Replace the water filter every ninety days.", 0.5),
            hit("c", "The water tank holds two hundred litres.", 0.7),
        ];
        let ranked = LexicalReranker::default()
            .rerank("How often to replace the water filter?", hits, 2)
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk.chunk_id, "b");
    }

    #[test]
    fn rerank_output_is_subset_of_candidates() {
        let hits: Vec<_> = (0..8)
            .map(|i| hit(&format!("c{i}"), &format!("passage number {i} about pumps"), 0.1))
            .collect();
        let ids: HashSet<String> = hits.iter().map(|h| h.chunk.chunk_id.clone()).collect();
        let ranked = LexicalReranker::default().rerank("pumps", hits, 5).unwrap();
        assert_eq!(ranked.len(), 5);
        assert!(ranked.iter().all(|h| ids.contains(&h.chunk.chunk_id)));
    }

    #[test]
    fn phrase_bonus_breaks_ties() {
        let scores = LexicalReranker::default()
            .score_batch(
                "seed bank",
                &["bank the seed".to_string(), "the seed bank".to_string()],
            )
            .unwrap();
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn tei_scores_are_mapped_back_to_input_order() {
        let ranked = vec![
            RerankScore { index: 1, score: 0.9 },
            RerankScore { index: 0, score: 0.2 },
        ];
        assert_eq!(scores_by_index(ranked, 2).unwrap(), vec![0.2, 0.9]);
        let missing = vec![RerankScore { index: 0, score: 0.2 }];
        assert!(scores_by_index(missing, 2).is_err());
    }

    #[test]
    fn disabled_config_builds_nothing() {
        let config = RerankerConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(build_reranker(&config).unwrap().is_none());
        let http = RerankerConfig {
            provider: RerankerProvider::Http,
            ..Default::default()
        };
        assert!(build_reranker(&http).is_err());
    }
}
