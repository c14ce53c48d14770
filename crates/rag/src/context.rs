use docqa_core::Chunk;

use crate::store::SearchHit;

pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 12_000;
/// Smallest accepted budget; room for the tags and a useful slice of text.
pub const MIN_CONTEXT_CHARS: usize = 256;

/// The prompt context and the hits that made it in, in ranking order.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub block: String,
    pub included: Vec<SearchHit>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

/// Renders hits as `<chunk>` blocks until `max_chars` is reached.
///
/// Whole chunks are added while they fit. A first chunk larger than the
/// budget is cut at a char boundary. The block never exceeds `max_chars`; a
/// budget too small for the tags yields an empty context.
pub fn assemble_context(hits: &[SearchHit], max_chars: usize) -> AssembledContext {
    let mut context = AssembledContext::default();
    let mut used = 0usize;
    for (idx, hit) in hits.iter().enumerate() {
        let rendered = render_chunk(&hit.chunk, &hit.chunk.text);
        let len = rendered.chars().count();
        if used + len <= max_chars {
            context.block.push_str(&rendered);
            context.included.push(hit.clone());
            used += len;
            continue;
        }
        let overhead = len - hit.chunk.text.chars().count();
        if idx == 0 && max_chars > overhead {
            let keep = max_chars - overhead;
            let truncated: String = hit.chunk.text.chars().take(keep).collect();
            context.block.push_str(&render_chunk(&hit.chunk, &truncated));
            context.included.push(hit.clone());
        }
        break;
    }
    context
}

fn render_chunk(chunk: &Chunk, text: &str) -> String {
    if chunk.is_single_page() {
        format!("<chunk page=\"{}\">\n{}\n</chunk>\n\n", chunk.page_start, text)
    } else {
        format!(
            "<chunk pages=\"{}-{}\">\n{}\n</chunk>\n\n",
            chunk.page_start, chunk.page_end, text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, text: &str, pages: (u32, u32)) -> SearchHit {
        SearchHit {
            chunk: Chunk {
                chunk_id: id.to_string(),
                doc_id: "doc".to_string(),
                doc_name: "doc.pdf".to_string(),
                text: text.to_string(),
                page_start: pages.0,
                page_end: pages.1,
            },
            score: 1.0,
        }
    }

    #[test]
    fn renders_single_pages_and_ranges() {
        let hits = vec![hit("a", "alpha", (3, 3)), hit("b", "beta", (4, 5))];
        let context = assemble_context(&hits, DEFAULT_MAX_CONTEXT_CHARS);
        assert_eq!(
            context.block,
            "<chunk page=\"3\">\nalpha\n</chunk>\n\n<chunk pages=\"4-5\">\nbeta\n</chunk>\n\n"
        );
        assert_eq!(context.included.len(), 2);
    }

    #[test]
    fn stops_at_budget() {
        let hits = vec![
            hit("a", &"x".repeat(50), (1, 1)),
            hit("b", &"y".repeat(50), (2, 2)),
        ];
        let context = assemble_context(&hits, 100);
        assert_eq!(context.included.len(), 1);
        assert!(!context.block.contains('y'));
    }

    #[test]
    fn oversized_first_chunk_is_truncated_on_char_boundary() {
        let hits = vec![hit("a", &"é".repeat(500), (1, 1))];
        let context = assemble_context(&hits, 100);
        assert_eq!(context.included.len(), 1);
        assert_eq!(context.block.chars().count(), 100);
    }

    #[test]
    fn budget_below_tag_overhead_includes_nothing() {
        let hits = vec![hit("a", &"z".repeat(100), (1, 2))];
        let context = assemble_context(&hits, 10);
        assert!(context.is_empty());
        assert!(context.block.is_empty());

        let context = assemble_context(&hits, 40);
        assert_eq!(context.included.len(), 1);
        assert_eq!(context.block.chars().count(), 40);
    }

    #[test]
    fn no_hits_is_empty() {
        assert!(assemble_context(&[], 100).is_empty());
    }
}
