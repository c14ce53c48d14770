use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::{header::HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

mod stream;

pub use stream::TokenStream;

use stream::{ndjson_stream, sse_stream, words_stream};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
/// Answer the local backend gives when the context does not cover the question.
pub const NOT_FOUND_ANSWER: &str = "Information not found in the selected document.";

const QUESTION_MARKER: &str = "Question:";
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "be", "can", "could", "did", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "should", "that", "the", "this",
    "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with", "would",
    "you", "your",
];

/// A backend that turns a system + user prompt into text.
pub trait Generator: Send + Sync {
    fn generate(&self, req: &LlmRequest) -> Result<LlmResponse>;

    /// Streams the answer as text fragments. Errors after the first fragment
    /// surface as an `Err` item.
    fn generate_stream(&self, req: &LlmRequest) -> Result<TokenStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Ollama,
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "qwen2.5:7b-instruct",
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Local => "local-extractive",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "ollama" => Ok(LlmProvider::Ollama),
            "openai" => Ok(LlmProvider::OpenAi),
            "local" => Ok(LlmProvider::Local),
            other => Err(anyhow!("unknown llm provider '{other}'")),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[llm]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_retries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            model: None,
            base_url: None,
            temperature: 0.1,
            max_retries: 6,
        }
    }
}

impl LlmConfig {
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    temperature: f32,
    max_retries: usize,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    Ollama(OllamaConfig),
    OpenAi(OpenAiConfig),
    Local,
}

#[derive(Clone)]
struct OllamaConfig {
    base_url: String,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let provider_config = match config.provider {
            LlmProvider::Ollama => ProviderConfig::Ollama(OllamaConfig {
                base_url: config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            }),
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        let http = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            provider: config.provider,
            model: config.model_name().to_string(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            config: provider_config,
        })
    }

    pub fn local() -> Self {
        Self {
            http: Client::new(),
            provider: LlmProvider::Local,
            model: LlmProvider::Local.default_model().to_string(),
            temperature: 0.0,
            max_retries: 0,
            config: ProviderConfig::Local,
        }
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::Ollama(cfg) => self.chat_ollama(cfg, req),
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req),
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }
    }

    pub fn chat_stream(&self, req: &LlmRequest) -> Result<TokenStream> {
        match &self.config {
            ProviderConfig::Ollama(cfg) => {
                let response = self.post_ollama(cfg, req, true)?;
                Ok(ndjson_stream(response))
            }
            ProviderConfig::OpenAi(cfg) => {
                let response = self.post_openai(cfg, req, true)?;
                Ok(sse_stream(response))
            }
            ProviderConfig::Local => Ok(words_stream(synthesize_local_response(req))),
        }
    }

    fn chat_ollama(&self, cfg: &OllamaConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let response = self.post_ollama(cfg, req, false)?;
        let value: OllamaChatResponse = response
            .json()
            .context("failed to decode ollama response")?;
        if let Some(error) = value.error {
            return Err(anyhow!("ollama returned an error: {error}"));
        }
        let content = value
            .message
            .map(|message| message.content)
            .ok_or_else(|| anyhow!("missing message in ollama response"))?;
        Ok(LlmResponse {
            content,
            prompt_tokens: value.prompt_eval_count.unwrap_or(0),
            completion_tokens: value.eval_count.unwrap_or(0),
        })
    }

    fn post_ollama(&self, cfg: &OllamaConfig, req: &LlmRequest, stream: bool) -> Result<Response> {
        let url = format!("{}/api/chat", cfg.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": chat_messages(req),
            "stream": stream,
            "options": { "temperature": self.temperature },
        });
        debug!(url = %url, model = %self.model, stream, "ollama chat request");
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .with_context(|| format!("ollama request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("ollama returned error (status {status}): {body}"));
        }
        Ok(response)
    }

    fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let response = self.post_openai(cfg, req, false)?;
        let value = decode_openai_body(response)?;
        let content = extract_openai_text(&value)
            .ok_or_else(|| anyhow!("missing text in OpenAI response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    /// Sends a chat completion, retrying transport errors and 429s with
    /// exponential backoff.
    fn post_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest, stream: bool) -> Result<Response> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": chat_messages(req),
            "temperature": self.temperature,
            "stream": stream,
        });
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(&url)
                .bearer_auth(&cfg.api_key)
                .json(&payload)
                .send()
            {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(err).with_context(|| "openai request failed");
                    }
                    warn!(attempt, error = %err, "openai request failed, retrying");
                    sleep(backoff_delay(attempt, None));
                    continue;
                }
            };
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > self.max_retries {
                    return Err(anyhow!(
                        "openai rate limited after {} retries",
                        self.max_retries
                    ));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                warn!(attempt, wait_secs = wait.as_secs(), "openai rate limited");
                sleep(wait);
                continue;
            }
            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(anyhow!("openai returned error (status {status}): {body}"));
            }
            return Ok(response);
        }
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        let content = synthesize_local_response(req);
        LlmResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

impl Generator for LlmClient {
    fn generate(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self.chat(req)
    }

    fn generate_stream(&self, req: &LlmRequest) -> Result<TokenStream> {
        self.chat_stream(req)
    }
}

fn chat_messages(req: &LlmRequest) -> Vec<Value> {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": req.user }));
    messages
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(6) as u32;
    Duration::from_secs(1u64 << capped)
}

/// Deterministic extractive answer used when no model server is available.
///
/// Reads the first `<chunk>` of the context and answers in the
/// Explanation/Evidence layout with its opening sentence as the quote.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let Some((page, body)) = first_context_chunk(&req.user) else {
        return NOT_FOUND_ANSWER.to_string();
    };
    if !question_overlaps_context(&req.user) {
        return NOT_FOUND_ANSWER.to_string();
    }
    let explanation = summarize_text(&body, 40);
    let quote = first_sentence(&body);
    format!("Explanation:\n{explanation}\n\nEvidence:\n• \"{quote}\" (Page {page})")
}

fn first_context_chunk(prompt: &str) -> Option<(String, String)> {
    let start = prompt.find("<chunk ")?;
    let rest = &prompt[start..];
    let tag_end = rest.find('>')?;
    let tag = &rest[..tag_end];
    let page = attribute_value(tag, "page=")
        .or_else(|| {
            attribute_value(tag, "pages=")
                .map(|range| range.split('-').next().unwrap_or_default().to_string())
        })?;
    let after = &rest[tag_end + 1..];
    let body_end = after.find("</chunk>").unwrap_or(after.len());
    let body = after[..body_end].trim().to_string();
    if body.is_empty() {
        return None;
    }
    Some((page, body))
}

/// True when the question has no content words or one of them occurs in a chunk.
fn question_overlaps_context(prompt: &str) -> bool {
    let (context, question) = match prompt.rfind(QUESTION_MARKER) {
        Some(idx) => (&prompt[..idx], &prompt[idx + QUESTION_MARKER.len()..]),
        None => (prompt, ""),
    };
    let terms: HashSet<String> = content_terms(question).collect();
    if terms.is_empty() {
        return true;
    }
    chunk_bodies(context)
        .flat_map(content_terms)
        .any(|term| terms.contains(&term))
}

fn chunk_bodies(text: &str) -> impl Iterator<Item = &str> {
    text.split("<chunk ").skip(1).filter_map(|block| {
        let after = &block[block.find('>')? + 1..];
        Some(&after[..after.find("</chunk>").unwrap_or(after.len())])
    })
}

fn content_terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .map(|mut word| {
            if word.len() > 3 && word.ends_with('s') {
                word.pop();
            }
            word
        })
}

fn attribute_value(tag: &str, key: &str) -> Option<String> {
    let idx = tag.find(key)?;
    let value = tag[idx + key.len()..].trim_start_matches('"');
    let end = value.find('"').unwrap_or(value.len());
    Some(value[..end].to_string())
}

fn first_sentence(text: &str) -> String {
    let end = text
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(text.len());
    text[..end].trim().to_string()
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn decode_openai_body(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!(format!(
            "openai returned error (status {}): {}",
            status, body
        )));
    }
    serde_json::from_str(&body).context("failed to decode openai response")
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!(format!("{var} is not set")))?;
    if value.trim().is_empty() {
        return Err(anyhow!(format!("{var} is empty")));
    }
    Ok(value)
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(|text| text.to_string())
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_prompt() -> String {
        "Context:\n<chunk page=\"3\">\nThe filter must be replaced every 90 days. Use gloves.\n</chunk>\n\n\
         <chunk page=\"4\">\nOther text.\n</chunk>\n\nQuestion: How often is the filter replaced?"
            .to_string()
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("OLLAMA".parse::<LlmProvider>().unwrap(), LlmProvider::Ollama);
        assert_eq!("openai".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAi);
        assert!("gemini".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn default_config_targets_ollama_qwen() {
        let config = LlmConfig::default();
        assert_eq!(config.provider, LlmProvider::Ollama);
        assert_eq!(config.model_name(), "qwen2.5:7b-instruct");
    }

    #[test]
    fn local_answer_quotes_first_chunk() {
        let client = LlmClient::local();
        let response = client
            .chat(&LlmRequest {
                system: None,
                user: context_prompt(),
            })
            .unwrap();
        assert!(response.content.starts_with("Explanation:"));
        assert!(response
            .content
            .contains("• \"The filter must be replaced every 90 days.\" (Page 3)"));
    }

    #[test]
    fn local_answer_uses_range_start() {
        let prompt = "Context:\n<chunk pages=\"5-6\">\nPumps need priming.\n</chunk>\n\nQuestion: ?";
        let content = synthesize_local_response(&LlmRequest {
            system: None,
            user: prompt.to_string(),
        });
        assert!(content.ends_with("(Page 5)"));
    }

    #[test]
    fn unrelated_question_gets_not_found() {
        let prompt = context_prompt().replace(
            "How often is the filter replaced?",
            "Who won the 1998 football world cup?",
        );
        let content = synthesize_local_response(&LlmRequest {
            system: None,
            user: prompt,
        });
        assert_eq!(content, NOT_FOUND_ANSWER);
    }

    #[test]
    fn overlap_in_any_chunk_is_enough() {
        let prompt = context_prompt().replace("How often is the filter replaced?", "Other texts?");
        let content = synthesize_local_response(&LlmRequest {
            system: None,
            user: prompt,
        });
        assert!(content.contains("(Page 3)"), "{content}");
    }

    #[test]
    fn local_stream_concatenates_to_blocking_answer() {
        let client = LlmClient::local();
        let req = LlmRequest {
            system: Some("system".to_string()),
            user: context_prompt(),
        };
        let blocking = client.generate(&req).unwrap().content;
        let streamed: String = client
            .generate_stream(&req)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .concat();
        assert_eq!(streamed, blocking);
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let header = HeaderValue::from_static("3");
        assert_eq!(backoff_delay(1, Some(&header)), Duration::from_secs(3));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(20, None), Duration::from_secs(64));
    }

    #[test]
    fn openai_message_content_is_extracted() {
        let value = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_openai_text(&value).as_deref(), Some("hello"));
        assert_eq!(extract_openai_text(&json!({})), None);
    }
}
