pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod evidence;
pub mod filter;
pub mod ingest;
pub mod pipeline;
pub mod prompt;
pub mod reranker;
pub mod services;
pub mod store;

pub use config::{DocQaConfig, DocumentsConfig, IndexConfig, RetrievalConfig, ServerConfig};
pub use context::{assemble_context, AssembledContext};
pub use embedding::{EmbeddingBackend, EmbeddingClient, EmbeddingConfig, EmbeddingProvider};
pub use error::IndexError;
pub use evidence::{check_evidence, parse_evidence, EvidenceQuote, EvidenceReport};
pub use filter::{Condition, Filter, PayloadField};
pub use ingest::{ingest_file, ingest_upload, IngestReport, IngestStatus};
pub use pipeline::{
    Answer, AnswerKind, AnswerStream, Citation, OutputMode, PipelineOptions, QaPipeline, Query,
    Response,
};
pub use prompt::{GREETING_REPLY, NOT_FOUND};
pub use reranker::{HttpReranker, LexicalReranker, Reranker, RerankerConfig, RerankerProvider};
pub use services::{ServiceContext, ServiceParts};
pub use store::{Distance, IndexPoint, Reservation, SearchHit, SqliteIndex, VectorIndex};
pub use docqa_llm::{Generator, LlmClient, LlmConfig, LlmProvider, LlmRequest, LlmResponse, TokenStream};
