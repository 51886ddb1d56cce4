//! Answer extraction from generation payloads.
//!
//! Turns ask the model for a structured answer:
//!
//! ```json
//! {"answer": {"kind": "markdown", "content": "...", "meta": {}}, "should_answer_to_user": true}
//! ```
//!
//! Providers do not always comply, so extraction degrades gracefully: a
//! payload that fails validation against [`answer_schema()`] is rendered as
//! plain text.

use crate::json_schema_for;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// How the answer text should be rendered by the channel.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnswerKind {
    #[default]
    Text,
    Html,
    Markdown,
}

impl std::fmt::Display for AnswerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerKind::Text => write!(f, "text"),
            AnswerKind::Html => write!(f, "html"),
            AnswerKind::Markdown => write!(f, "markdown"),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct AnswerBody {
    pub kind: AnswerKind,
    #[schemars(length(min = 1))]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

/// The structured output requested from the model on every turn.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub answer: AnswerBody,
    /// Whether the channel should deliver this answer at all.
    pub should_answer_to_user: bool,
}

/// JSON Schema for [`AnswerPayload`].
pub fn answer_schema() -> Value {
    json_schema_for::<AnswerPayload>()
}

/// Answer text ready for the history store and the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAnswer {
    pub kind: AnswerKind,
    pub text: String,
    pub meta: Map<String, Value>,
    pub should_reply: bool,
}

impl RenderedAnswer {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            kind: AnswerKind::Text,
            text: text.into(),
            meta: Map::new(),
            should_reply: true,
        }
    }
}

/// Pulls answer text out of a provider payload.
pub trait AnswerExtractor: Send + Sync {
    fn extract_answer(&self, payload: &Value) -> RenderedAnswer;
}

/// Validates payloads against [`answer_schema()`] with `jsonschema`.
pub struct StructuredAnswerExtractor {
    validator: Option<jsonschema::Validator>,
}

impl Default for StructuredAnswerExtractor {
    fn default() -> Self {
        // An uncompilable schema skips validation; serde still guards the shape.
        let validator = jsonschema::validator_for(&answer_schema()).ok();
        Self { validator }
    }
}

impl StructuredAnswerExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn structured(&self, object: &Value) -> Option<RenderedAnswer> {
        if let Some(validator) = &self.validator {
            let errors: Vec<String> = validator
                .iter_errors(object)
                .map(|e| format!("{}: {e}", e.instance_path()))
                .collect();
            if !errors.is_empty() {
                debug!(
                    "Structured answer failed validation: {}",
                    errors.join("; ")
                );
                return None;
            }
        }
        let payload: AnswerPayload = serde_json::from_value(object.clone()).ok()?;
        if payload.answer.content.trim().is_empty() {
            return None;
        }
        Some(RenderedAnswer {
            kind: payload.answer.kind,
            text: payload.answer.content,
            meta: payload.answer.meta.unwrap_or_default(),
            should_reply: payload.should_answer_to_user,
        })
    }
}

/// Parse `text` as JSON, retrying without a surrounding ```json fence.
pub fn parse_json_with_fence(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let trimmed = text.trim();
    let body = strip_prefix_ignore_case(trimmed, "```json")
        .or_else(|| trimmed.strip_prefix("```"))?;
    let body = body.trim().strip_suffix("```").unwrap_or(body);
    serde_json::from_str(body.trim()).ok()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| text.get(prefix.len()..))
        .flatten()
}

impl AnswerExtractor for StructuredAnswerExtractor {
    fn extract_answer(&self, payload: &Value) -> RenderedAnswer {
        let object = match payload {
            Value::Object(_) => Some(payload.clone()),
            Value::String(text) => parse_json_with_fence(text).filter(Value::is_object),
            _ => None,
        };
        if let Some(answer) = object.as_ref().and_then(|o| self.structured(o)) {
            debug!("Structured answer extracted (kind={})", answer.kind);
            return answer;
        }
        match payload {
            Value::String(text) => RenderedAnswer::plain(text.clone()),
            other => RenderedAnswer::plain(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_requires_answer_fields() {
        let schema = answer_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("answer")));
        assert!(required.contains(&json!("should_answer_to_user")));
    }

    #[test]
    fn extracts_object_payload() {
        let extractor = StructuredAnswerExtractor::new();
        let answer = extractor.extract_answer(&json!({
            "answer": {"kind": "markdown", "content": "**hi**", "meta": {"lang": "en"}},
            "should_answer_to_user": false
        }));
        assert_eq!(answer.kind, AnswerKind::Markdown);
        assert_eq!(answer.text, "**hi**");
        assert_eq!(answer.meta["lang"], "en");
        assert!(!answer.should_reply);
    }

    #[test]
    fn extracts_fenced_json_string() {
        let extractor = StructuredAnswerExtractor::new();
        let payload = json!(
            "```json\n{\"answer\": {\"kind\": \"text\", \"content\": \"Summary.\"}, \"should_answer_to_user\": true}\n```"
        );
        let answer = extractor.extract_answer(&payload);
        assert_eq!(answer.text, "Summary.");
        assert!(answer.should_reply);
    }

    #[test]
    fn plain_string_is_used_verbatim() {
        let extractor = StructuredAnswerExtractor::new();
        let answer = extractor.extract_answer(&json!("Summary."));
        assert_eq!(answer, RenderedAnswer::plain("Summary."));
    }

    #[test]
    fn invalid_structure_falls_back_to_text() {
        let extractor = StructuredAnswerExtractor::new();
        let raw = r#"{"answer": {"kind": "pdf", "content": "x"}, "should_answer_to_user": true}"#;
        let answer = extractor.extract_answer(&json!(raw));
        assert_eq!(answer.kind, AnswerKind::Text);
        assert_eq!(answer.text, raw);

        let blank = extractor.extract_answer(&json!({
            "answer": {"kind": "text", "content": "   "},
            "should_answer_to_user": true
        }));
        assert_eq!(blank.kind, AnswerKind::Text);
        assert!(blank.text.contains("should_answer_to_user"));
    }

    #[test]
    fn non_string_payload_renders_json_text() {
        let extractor = StructuredAnswerExtractor::new();
        assert_eq!(extractor.extract_answer(&json!(42)).text, "42");
    }

    #[test]
    fn fence_parsing() {
        assert_eq!(parse_json_with_fence("{\"a\":1}"), Some(json!({"a": 1})));
        assert_eq!(parse_json_with_fence("```JSON\n[1]\n```"), Some(json!([1])));
        assert_eq!(parse_json_with_fence("```\n{}\n```"), Some(json!({})));
        assert_eq!(parse_json_with_fence("not json"), None);
    }
}
