mod chunk;
mod document;
mod embedding;
mod error;
mod extract;
mod semantic;

pub use chunk::{Chunk, ChunkConfig, ChunkPolicy, Chunker};
pub use document::{
    list_documents, normalize_doc_id, random_doc_id, DocIdStrategy, DocumentEntry,
    DocumentRecord, PageText,
};
pub use embedding::{
    cosine_similarity, dot_product, normalize, Embedder, HashEmbedder, HashEmbedderConfig,
};
pub use error::{CoreError, Result};
pub use extract::{clean_page_text, is_supported, FileExtractor, TextExtractor, SUPPORTED_EXTENSIONS};
