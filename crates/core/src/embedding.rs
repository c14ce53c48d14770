use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maps text to fixed-dimension vectors.
///
/// Implementations are shared across request threads and must be safe for
/// concurrent calls.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn embed_batch(&self, inputs: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embeds a search query. Backends that distinguish query and passage
    /// encodings override this.
    fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed(text)
    }

    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let inputs = vec![text.to_string()];
        let mut output = self.embed_batch(&inputs)?;
        Ok(output.pop().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            seed: 1337,
        }
    }
}

/// Deterministic bag-of-words embedder. Needs no model files, which makes it
/// the offline default and the embedder used in tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dims = self.config.dimensions.max(1);
        let mut vector = vec![0f32; dims];
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let bucket = self.bucket_for(token);
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.config.seed);
        token.to_lowercase().hash(&mut hasher);
        (hasher.finish() as usize) % self.config.dimensions.max(1)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HashEmbedderConfig::default())
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.config.dimensions.max(1)
    }

    fn embed_batch(&self, inputs: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embeddings_are_normalized_and_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_text("Water pump maintenance");
        let b = embedder.embed_text("water pump maintenance");
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed_text("   ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn overlapping_texts_are_closer() {
        let embedder = HashEmbedder::default();
        let query = embedder.embed_text("filter replacement interval");
        let near = embedder.embed_text("the filter replacement interval is six months");
        let far = embedder.embed_text("solar panels face south");
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[test]
    fn embed_uses_batch() {
        let embedder = HashEmbedder::new(HashEmbedderConfig {
            dimensions: 16,
            seed: 7,
        });
        let single = embedder.embed("alpha beta").unwrap();
        assert_eq!(single, embedder.embed_text("alpha beta"));
        assert_eq!(embedder.embed_query("alpha beta").unwrap(), single);
        assert_eq!(embedder.dimensions(), 16);
    }
}
