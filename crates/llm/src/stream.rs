use std::io::{BufRead, BufReader};

use anyhow::{anyhow, Result};
use reqwest::blocking::Response;
use serde_json::Value;

/// Fragments of a generated answer in arrival order.
pub type TokenStream = Box<dyn Iterator<Item = Result<String>> + Send>;

/// Ollama streams one JSON object per line until `"done": true`.
pub(crate) fn ndjson_stream(response: Response) -> TokenStream {
    let mut lines = BufReader::new(response).lines();
    let mut finished = false;
    Box::new(std::iter::from_fn(move || loop {
        if finished {
            return None;
        }
        let line = match lines.next()? {
            Ok(line) => line,
            Err(err) => {
                finished = true;
                return Some(Err(anyhow!("ollama stream interrupted: {err}")));
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_ndjson_line(&line) {
            Ok(NdjsonEvent::Token(text)) => {
                if !text.is_empty() {
                    return Some(Ok(text));
                }
            }
            Ok(NdjsonEvent::Done(text)) => {
                finished = true;
                if !text.is_empty() {
                    return Some(Ok(text));
                }
                return None;
            }
            Err(err) => {
                finished = true;
                return Some(Err(err));
            }
        }
    }))
}

/// OpenAI-compatible servers stream `data: {...}` events ending in `[DONE]`.
pub(crate) fn sse_stream(response: Response) -> TokenStream {
    let mut lines = BufReader::new(response).lines();
    let mut finished = false;
    Box::new(std::iter::from_fn(move || loop {
        if finished {
            return None;
        }
        let line = match lines.next()? {
            Ok(line) => line,
            Err(err) => {
                finished = true;
                return Some(Err(anyhow!("openai stream interrupted: {err}")));
            }
        };
        match parse_sse_line(&line) {
            Ok(SseEvent::Skip) => continue,
            Ok(SseEvent::Done) => {
                finished = true;
                return None;
            }
            Ok(SseEvent::Token(text)) => return Some(Ok(text)),
            Err(err) => {
                finished = true;
                return Some(Err(err));
            }
        }
    }))
}

pub(crate) fn words_stream(text: String) -> TokenStream {
    let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
    Box::new(words.into_iter().map(Ok))
}

#[derive(Debug, PartialEq)]
enum NdjsonEvent {
    Token(String),
    Done(String),
}

fn parse_ndjson_line(line: &str) -> Result<NdjsonEvent> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| anyhow!("invalid ollama stream line: {err}"))?;
    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        return Err(anyhow!("ollama returned an error: {error}"));
    }
    let text = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        Ok(NdjsonEvent::Done(text))
    } else {
        Ok(NdjsonEvent::Token(text))
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let value: Value =
        serde_json::from_str(data).map_err(|err| anyhow!("invalid openai stream event: {err}"))?;
    if let Some(error) = value.get("error") {
        return Err(anyhow!("openai returned an error: {error}"));
    }
    let text = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|content| content.as_str());
    match text {
        Some(text) if !text.is_empty() => Ok(SseEvent::Token(text.to_string())),
        _ => Ok(SseEvent::Skip),
    }
}
