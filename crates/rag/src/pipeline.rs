use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use docqa_core::Chunk;
use docqa_llm::TokenStream;

use crate::config::RetrievalConfig;
use crate::context::{assemble_context, AssembledContext};
use crate::evidence::check_evidence;
use crate::filter::Filter;
use crate::prompt::{backend_error_text, build_request, is_greeting, GREETING_REPLY, NOT_FOUND};
use crate::services::ServiceContext;
use crate::store::SearchHit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub doc_id: String,
    #[serde(alias = "query")]
    pub text: String,
}

impl Query {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Blocking,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub rerank: bool,
    pub candidates: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub check_evidence: bool,
    pub output: OutputMode,
}

impl PipelineOptions {
    pub fn from_config(retrieval: &RetrievalConfig) -> Self {
        Self {
            rerank: true,
            candidates: retrieval.candidates,
            top_k: retrieval.top_k,
            max_context_chars: retrieval.max_context_chars,
            check_evidence: retrieval.check_evidence,
            output: OutputMode::Blocking,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Greeting,
    NotFound,
    Generated,
    BackendError,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub page_start: u32,
    pub page_end: u32,
    pub score: f32,
    pub text: String,
}

impl From<&SearchHit> for Citation {
    fn from(hit: &SearchHit) -> Self {
        Self {
            chunk_id: hit.chunk.chunk_id.clone(),
            page_start: hit.chunk.page_start,
            page_end: hit.chunk.page_end,
            score: hit.score,
            text: hit.chunk.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub kind: AnswerKind,
    pub citations: Vec<Citation>,
}

impl Answer {
    fn fixed(kind: AnswerKind, text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind,
            citations: Vec::new(),
        }
    }

    /// A model that declines with the sentinel gets no citations.
    fn generated(text: String, citations: Vec<Citation>) -> Self {
        if text.trim() == NOT_FOUND {
            return Self::fixed(AnswerKind::NotFound, NOT_FOUND);
        }
        Self {
            text,
            kind: AnswerKind::Generated,
            citations,
        }
    }
}

/// A streamed answer. Backend errors end the stream with the error text as
/// the final fragment.
pub struct AnswerStream {
    kind: AnswerKind,
    citations: Vec<Citation>,
    fragments: TokenStream,
    finished: bool,
    evidence: Option<(Vec<Chunk>, String)>,
}

impl AnswerStream {
    fn fixed(kind: AnswerKind, text: &str) -> Self {
        Self {
            kind,
            citations: Vec::new(),
            fragments: Box::new(std::iter::once(Ok(text.to_string()))),
            finished: false,
            evidence: None,
        }
    }

    pub fn kind(&self) -> AnswerKind {
        self.kind
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    /// Drains the stream into a blocking [`Answer`].
    pub fn collect_answer(mut self) -> Answer {
        let mut text = String::new();
        for fragment in self.by_ref() {
            text.push_str(&fragment);
        }
        match self.kind {
            AnswerKind::Generated => Answer::generated(text, self.citations),
            kind => Answer {
                text,
                kind,
                citations: self.citations,
            },
        }
    }
}

impl Iterator for AnswerStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.fragments.next() {
            Some(Ok(fragment)) => {
                if let Some((_, collected)) = self.evidence.as_mut() {
                    collected.push_str(&fragment);
                }
                Some(fragment)
            }
            Some(Err(err)) => {
                self.finished = true;
                self.kind = AnswerKind::BackendError;
                self.evidence = None;
                warn!(error = %err, "generation stream failed");
                Some(backend_error_text(&err))
            }
            None => {
                self.finished = true;
                if let Some((chunks, collected)) = self.evidence.take() {
                    log_evidence(&collected, &chunks);
                }
                None
            }
        }
    }
}

pub enum Response {
    Complete(Answer),
    Stream(AnswerStream),
}

/// Question answering over one document: embed, filtered search, optional
/// rerank, context assembly and generation.
pub struct QaPipeline<'a> {
    ctx: &'a ServiceContext,
    options: PipelineOptions,
}

impl<'a> QaPipeline<'a> {
    pub fn new(ctx: &'a ServiceContext, options: PipelineOptions) -> Self {
        Self { ctx, options }
    }

    pub fn with_defaults(ctx: &'a ServiceContext) -> Self {
        let mut options = PipelineOptions::from_config(&ctx.config().retrieval);
        options.rerank = ctx.reranker().is_some();
        Self::new(ctx, options)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Answers according to the configured [`OutputMode`].
    pub fn respond(&self, query: &Query) -> Result<Response> {
        match self.options.output {
            OutputMode::Blocking => self.answer(query).map(Response::Complete),
            OutputMode::Streaming => self.answer_stream(query).map(Response::Stream),
        }
    }

    /// Retrieval errors propagate; generation errors become the answer text.
    pub fn answer(&self, query: &Query) -> Result<Answer> {
        if is_greeting(&query.text) {
            return Ok(Answer::fixed(AnswerKind::Greeting, GREETING_REPLY));
        }
        let context = self.build_context(query)?;
        if context.is_empty() {
            return Ok(Answer::fixed(AnswerKind::NotFound, NOT_FOUND));
        }
        let citations = context.included.iter().map(Citation::from).collect();
        let request = build_request(&context.block, &query.text);
        match self.ctx.generator().generate(&request) {
            Ok(response) => {
                debug!(tokens = response.total_tokens(), "generated answer");
                if self.options.check_evidence {
                    let chunks: Vec<Chunk> =
                        context.included.iter().map(|h| h.chunk.clone()).collect();
                    log_evidence(&response.content, &chunks);
                }
                Ok(Answer::generated(response.content, citations))
            }
            Err(err) => {
                warn!(error = %err, "generation failed");
                Ok(Answer {
                    text: backend_error_text(&err),
                    kind: AnswerKind::BackendError,
                    citations,
                })
            }
        }
    }

    pub fn answer_stream(&self, query: &Query) -> Result<AnswerStream> {
        if is_greeting(&query.text) {
            return Ok(AnswerStream::fixed(AnswerKind::Greeting, GREETING_REPLY));
        }
        let context = self.build_context(query)?;
        if context.is_empty() {
            return Ok(AnswerStream::fixed(AnswerKind::NotFound, NOT_FOUND));
        }
        let citations: Vec<Citation> = context.included.iter().map(Citation::from).collect();
        let request = build_request(&context.block, &query.text);
        match self.ctx.generator().generate_stream(&request) {
            Ok(fragments) => {
                let evidence = self.options.check_evidence.then(|| {
                    let chunks = context.included.iter().map(|h| h.chunk.clone()).collect();
                    (chunks, String::new())
                });
                Ok(AnswerStream {
                    kind: AnswerKind::Generated,
                    citations,
                    fragments,
                    finished: false,
                    evidence,
                })
            }
            Err(err) => {
                warn!(error = %err, "generation stream could not start");
                let mut stream =
                    AnswerStream::fixed(AnswerKind::BackendError, &backend_error_text(&err));
                stream.citations = citations;
                Ok(stream)
            }
        }
    }

    fn build_context(&self, query: &Query) -> Result<AssembledContext> {
        let hits = self.retrieve(query)?;
        Ok(assemble_context(&hits, self.options.max_context_chars))
    }

    /// Filtered vector search for `query.doc_id`, then the optional rerank.
    pub fn retrieve(&self, query: &Query) -> Result<Vec<SearchHit>> {
        let filter = Filter::doc_id(&query.doc_id)?;
        let vector = self.ctx.embedder().embed_query(&query.text)?;
        let reranker = self.ctx.reranker().filter(|_| self.options.rerank);
        let limit = match reranker {
            Some(_) => self.options.candidates.max(self.options.top_k),
            None => self.options.top_k,
        };
        let mut hits = self
            .ctx
            .index()
            .search(self.ctx.collection(), &vector, Some(&filter), limit)?;
        debug!(doc_id = %query.doc_id, candidates = hits.len(), limit, "vector search");

        let Some(reranker) = reranker else {
            return Ok(hits);
        };
        match reranker.rerank(&query.text, hits.clone(), self.options.top_k) {
            Ok(reranked) => {
                debug!(kept = reranked.len(), reranker = reranker.name(), "reranked");
                Ok(reranked)
            }
            Err(err) => {
                warn!(error = %err, reranker = reranker.name(), "rerank failed, keeping vector order");
                hits.truncate(self.options.top_k);
                Ok(hits)
            }
        }
    }
}

fn log_evidence(answer: &str, chunks: &[Chunk]) {
    let report = check_evidence(answer, chunks);
    if !report.is_grounded() {
        warn!(
            quotes = report.quotes.len(),
            ungrounded = report.ungrounded.len(),
            "answer cites evidence not found in context"
        );
    } else {
        debug!(quotes = report.quotes.len(), "evidence grounded");
    }
}
