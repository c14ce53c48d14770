use docqa_llm::{LlmRequest, NOT_FOUND_ANSWER};

pub const GREETINGS: &[&str] = &["hi", "hello", "hey", "greetings", "hola"];

pub const GREETING_REPLY: &str = "Hello! I am ready to answer questions about your document.";

pub const NOT_FOUND: &str = NOT_FOUND_ANSWER;

pub const SYSTEM_PROMPT: &str = "You are a precise technical assistant. \
Answer the user's question using ONLY the provided context chunks. \
Do not use outside knowledge. \
If the answer is not in the chunks, say 'Information not found in the selected document.'\n\n\
FORMATTING RULES:\n\
1. Start with a clear 'Explanation:'.\n\
2. Use bullet points (*) for lists and bolding (**) for key terms in the explanation.\n\
3. Follow with 'Evidence:'.\n\
4. Under Evidence, list exact quotes from the text that support your answer.\n\
5. Format quotes as: • \"<exact quote>\" (Page <number>)\n\
6. Do not make up quotes or page numbers.";

pub fn is_greeting(query: &str) -> bool {
    let normalized = query.trim().to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

pub fn build_request(context: &str, query: &str) -> LlmRequest {
    LlmRequest {
        system: Some(SYSTEM_PROMPT.to_string()),
        user: format!("Context:\n{context}\n\nQuestion: {query}"),
    }
}

pub fn backend_error_text(err: &anyhow::Error) -> String {
    format!("Error communicating with LLM: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greetings_are_trimmed_and_case_insensitive() {
        assert!(is_greeting("  Hello "));
        assert!(is_greeting("HOLA"));
        assert!(!is_greeting("hello there"));
        assert!(!is_greeting("what is hi?"));
    }

    #[test]
    fn request_wraps_context_and_question() {
        let req = build_request("<chunk page=\"1\">\nx\n</chunk>\n\n", "What is x?");
        assert!(req.user.starts_with("Context:\n<chunk page=\"1\">"));
        assert!(req.user.ends_with("\n\nQuestion: What is x?"));
        assert!(req.system.unwrap().contains(NOT_FOUND));
    }
}
