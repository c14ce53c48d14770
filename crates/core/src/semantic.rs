use unicode_segmentation::UnicodeSegmentation;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{CoreError, Result};

/// Splits one page into semantically coherent groups of sentences.
///
/// Every sentence is embedded together with `buffer_size` neighbours on each
/// side. A group ends wherever the cosine distance to the next sentence group
/// is above the `percentile` of all adjacent distances on the page.
pub(crate) fn split_semantic(
    text: &str,
    buffer_size: usize,
    percentile: f32,
    embedder: &dyn Embedder,
) -> Result<Vec<String>> {
    let sentences = split_sentences(text);
    if sentences.len() <= 1 {
        return Ok(sentences);
    }
    let windows = buffered_windows(&sentences, buffer_size);
    let embeddings = embedder
        .embed_batch(&windows)
        .map_err(|e| CoreError::Embedding(e.to_string()))?;
    if embeddings.len() != windows.len() {
        return Err(CoreError::Embedding(format!(
            "expected {} sentence embeddings, got {}",
            windows.len(),
            embeddings.len()
        )));
    }
    let distances: Vec<f32> = embeddings
        .windows(2)
        .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
        .collect();
    let threshold = percentile_of(&distances, percentile);

    let mut groups = Vec::new();
    let mut start = 0usize;
    for (idx, distance) in distances.iter().enumerate() {
        if *distance > threshold {
            groups.push(sentences[start..=idx].join(" "));
            start = idx + 1;
        }
    }
    groups.push(sentences[start..].join(" "));
    Ok(groups)
}

pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    text.split_sentence_bounds()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn buffered_windows(sentences: &[String], buffer_size: usize) -> Vec<String> {
    (0..sentences.len())
        .map(|idx| {
            let start = idx.saturating_sub(buffer_size);
            let end = (idx + buffer_size + 1).min(sentences.len());
            sentences[start..end].join(" ")
        })
        .collect()
}

/// Linear-interpolated percentile over `values`, `pct` in `[0, 100]`.
pub(crate) fn percentile_of(values: &[f32], pct: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
