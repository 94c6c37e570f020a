//! Prompt assembly from retrieval results.
//!
//! [`ContextBuilder::build_context`] renders ranked chunks and images as a
//! markdown block bounded by a character budget of `max_tokens * 4`.
//! [`ContextBuilder::build_prompt`] wraps that block and the user's question
//! in a fixed framing for the generation model.

use crate::models::RetrievalResult;

/// Appended, after a blank line, when the context block was cut.
pub const TRUNCATION_MARKER: &str = "[Context truncated...]";

const TRUNCATION_SEPARATOR: &str = "\n\n";
const CHARS_PER_TOKEN: usize = 4;
const DEFAULT_MAX_TOKENS: usize = 2000;

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    max_tokens: usize,
}

impl ContextBuilder {
    /// A zero budget falls back to 2000 tokens.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: if max_tokens == 0 {
                DEFAULT_MAX_TOKENS
            } else {
                max_tokens
            },
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    /// Render `result` in rank order.
    ///
    /// Output never exceeds `max_chars() + TRUNCATION_MARKER.len()` characters.
    /// The marker is present if and only if content was cut; the cut is a
    /// hard stop at a character boundary.
    pub fn build_context(&self, result: &RetrievalResult) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !result.chunks.is_empty() {
            parts.push("## Relevant Text Excerpts:".to_string());
            for (i, hit) in result.chunks.iter().enumerate() {
                parts.push(format!("\n### Excerpt {}:", i + 1));
                parts.push(hit.item.content.clone());
                parts.push(String::new());
            }
        }

        if !result.images.is_empty() {
            parts.push("## Relevant Images:".to_string());
            for (i, hit) in result.images.iter().enumerate() {
                parts.push(format!("\n### Image {}:", i + 1));
                if let Some(caption) = hit.item.caption.as_deref().filter(|c| !c.is_empty()) {
                    parts.push(format!("Caption: {}", caption));
                }
                parts.push(format!("Source: {}", hit.item.file_path));
                parts.push(String::new());
            }
        }

        truncate(parts.join("\n"), self.max_chars())
    }

    /// Frame `context` (may be empty) and the raw question as one prompt.
    pub fn build_prompt(&self, context: &str, query: &str) -> String {
        let mut parts: Vec<&str> = vec![
            "You are a knowledgeable assistant answering questions from a library of documents.",
            "You have access to a knowledge base built from the user's PDF and EPUB files.",
            "",
        ];

        if !context.is_empty() {
            parts.push("## Knowledge Base Context:");
            parts.push(context);
            parts.push("");
        }

        parts.push("## User Question:");
        parts.push(query);
        parts.push("");
        parts.push(
            "Please provide a thoughtful, detailed response based on the context provided above.",
        );
        parts.push(
            "If the context doesn't contain relevant information, you can draw from your general knowledge,",
        );
        parts.push("but please indicate when you're doing so.");

        parts.join("\n")
    }

    /// Ids of the chunks in `result`, in rank order.
    pub fn chunk_ids(result: &RetrievalResult) -> Vec<String> {
        result.chunks.iter().map(|c| c.item.id.clone()).collect()
    }

    /// Ids of the images in `result`, in rank order.
    pub fn image_ids(result: &RetrievalResult) -> Vec<String> {
        result.images.iter().map(|i| i.item.id.clone()).collect()
    }
}

fn truncate(context: String, max_chars: usize) -> String {
    if context.chars().count() <= max_chars {
        return context;
    }
    let keep = max_chars.saturating_sub(TRUNCATION_SEPARATOR.len());
    let cut = context
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(context.len());
    let mut out = String::with_capacity(cut + TRUNCATION_SEPARATOR.len() + TRUNCATION_MARKER.len());
    out.push_str(&context[..cut]);
    out.push_str(TRUNCATION_SEPARATOR);
    out.push_str(TRUNCATION_MARKER);
    out
}
