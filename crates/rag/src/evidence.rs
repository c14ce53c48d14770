use docqa_core::Chunk;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceQuote {
    pub quote: String,
    pub page: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceReport {
    pub quotes: Vec<EvidenceQuote>,
    pub ungrounded: Vec<EvidenceQuote>,
}

impl EvidenceReport {
    pub fn is_grounded(&self) -> bool {
        self.ungrounded.is_empty()
    }
}

/// Extracts `• "quote" (Page N)` lines from a generated answer.
pub fn parse_evidence(answer: &str) -> Vec<EvidenceQuote> {
    answer.lines().filter_map(parse_quote_line).collect()
}

/// A quote is grounded when a context chunk covering its page contains it
/// verbatim, ignoring case and whitespace runs.
pub fn check_evidence(answer: &str, chunks: &[Chunk]) -> EvidenceReport {
    let quotes = parse_evidence(answer);
    let ungrounded = quotes
        .iter()
        .filter(|q| {
            let needle = normalize(&q.quote);
            !chunks
                .iter()
                .any(|c| c.covers_page(q.page) && normalize(&c.text).contains(&needle))
        })
        .cloned()
        .collect();
    EvidenceReport { quotes, ungrounded }
}

fn parse_quote_line(line: &str) -> Option<EvidenceQuote> {
    let line = line.trim();
    let body = line
        .strip_prefix('•')
        .or_else(|| line.strip_prefix('*'))
        .or_else(|| line.strip_prefix('-'))?
        .trim_start();
    let open = body.find(['"', '“'])?;
    let page_idx = body.rfind("(Page")?;
    let quoted = body[..page_idx].trim_end();
    let close = quoted.rfind(['"', '”'])?;
    let open_len = body[open..].chars().next()?.len_utf8();
    if close <= open {
        return None;
    }
    let quote = quoted[open + open_len..close].trim().to_string();
    let digits: String = body[page_idx + "(Page".len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let page = digits.parse().ok()?;
    if quote.is_empty() {
        return None;
    }
    Some(EvidenceQuote { quote, page })
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
