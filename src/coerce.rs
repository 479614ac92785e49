//! Coercion of LLM responses into typed records.
//!
//! Providers return text that is supposed to be JSON but often is not
//! quite: reasoning models prefix `<think>…</think>` blocks, chatty models
//! wrap the payload in markdown fences or prose. These helpers extract the
//! structured part defensively so a single malformed response downgrades
//! one item instead of failing a stage.

use crate::error::Result;
use crate::PipelineError;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Remove `<think>...</think>` blocks from a response and trim.
pub fn strip_think_tags(text: &str) -> String {
    let think_start = "<think>";
    let think_end = "</think>";

    let mut cleaned = text.to_string();
    while let (Some(start), Some(end)) = (cleaned.find(think_start), cleaned.find(think_end)) {
        if end < start {
            break;
        }
        let mut next = String::with_capacity(cleaned.len());
        next.push_str(&cleaned[..start]);
        next.push_str(&cleaned[end + think_end.len()..]);
        cleaned = next;
    }
    cleaned.trim().to_string()
}

/// Extract JSON content from markdown fenced code blocks.
fn extract_json_block(text: &str) -> Option<String> {
    let markers = ["```json", "```JSON", "```"];
    for marker in markers {
        if let Some(start) = text.find(marker) {
            let content_start = start + marker.len();
            if let Some(end) = text[content_start..].find("```") {
                return Some(text[content_start..content_start + end].trim().to_string());
            }
        }
    }
    None
}

/// Locate a JSON object or array inside text that may contain surrounding
/// prose. Tries, in order: markdown fence extraction, then the first `{` or
/// `[` with a matching closer.
pub fn extract_json_candidate(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(block) = extract_json_block(trimmed) {
        return Some(block);
    }

    if let Some(idx) = trimmed.find('{').or_else(|| trimmed.find('[')) {
        let candidate = &trimmed[idx..];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
        let open = candidate.as_bytes()[0];
        let close = if open == b'{' { '}' } else { ']' };
        if let Some(end) = candidate.rfind(close) {
            let substr = &candidate[..=end];
            if serde_json::from_str::<Value>(substr).is_ok() {
                return Some(substr.to_string());
            }
        }
    }

    None
}

/// Parse text into a typed `T` with defensive JSON extraction.
///
/// Tries a direct parse, then strips think tags and re-tries, then falls
/// back to fence/embedded-JSON extraction. Failure is a
/// [`PipelineError::Parse`] carrying a truncated sample of the raw text.
pub fn parse_as<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let cleaned = strip_think_tags(trimmed);
    if let Ok(value) = serde_json::from_str::<T>(&cleaned) {
        return Ok(value);
    }

    if let Some(candidate) = extract_json_candidate(&cleaned) {
        if let Ok(value) = serde_json::from_str::<T>(&candidate) {
            return Ok(value);
        }
    }

    let sample: String = trimmed.chars().take(200).collect();
    Err(PipelineError::Parse(format!(
        "no conforming JSON in LLM output; raw text (truncated): {sample}"
    )))
}

/// Like [`parse_as`] but for callers that only need the summary text of a
/// response: returns the parsed field on success, or the think-stripped raw
/// text when the response is not valid JSON.
pub fn parse_or_plain_text<T, F>(text: &str, field: F) -> String
where
    T: DeserializeOwned,
    F: FnOnce(T) -> String,
{
    match parse_as::<T>(text) {
        Ok(value) => field(value),
        Err(_) => strip_think_tags(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        label: String,
    }

    #[test]
    fn test_parse_direct() {
        let reply: Reply = parse_as(r#"{"label": "transit"}"#).unwrap();
        assert_eq!(reply.label, "transit");
    }

    #[test]
    fn test_parse_with_think_prefix() {
        let text = "<think>these comments are about trains</think>{\"label\": \"transit\"}";
        let reply: Reply = parse_as(text).unwrap();
        assert_eq!(reply.label, "transit");
    }

    #[test]
    fn test_parse_from_markdown_fence() {
        let text = "Here you go:\n```json\n{\"label\": \"parks\"}\n```\nDone.";
        let reply: Reply = parse_as(text).unwrap();
        assert_eq!(reply.label, "parks");
    }

    #[test]
    fn test_parse_embedded_in_prose() {
        let text = "Sure! {\"label\": \"housing\"} hope that helps.";
        let reply: Reply = parse_as(text).unwrap();
        assert_eq!(reply.label, "housing");
    }

    #[test]
    fn test_parse_failure_is_parse_error() {
        let result = parse_as::<Reply>("not json at all");
        assert!(matches!(result.unwrap_err(), PipelineError::Parse(_)));
    }

    #[test]
    fn test_strip_think_tags_multiple_blocks() {
        let text = "<think>a</think>first<think>b</think> second";
        assert_eq!(strip_think_tags(text), "first second");
    }

    #[test]
    fn test_strip_think_tags_absent() {
        assert_eq!(strip_think_tags("  plain  "), "plain");
    }

    #[test]
    fn test_parse_or_plain_text_fallback() {
        #[derive(Deserialize)]
        struct Summary {
            summary: String,
        }
        let ok = parse_or_plain_text(r#"{"summary": "short"}"#, |s: Summary| s.summary);
        assert_eq!(ok, "short");

        let fallback =
            parse_or_plain_text("<think>hmm</think>Just a paragraph.", |s: Summary| s.summary);
        assert_eq!(fallback, "Just a paragraph.");
    }

    #[test]
    fn test_extract_json_candidate_array() {
        let text = "List: [1, 2, 3] end";
        assert_eq!(extract_json_candidate(text).unwrap(), "[1, 2, 3]");
    }
}
