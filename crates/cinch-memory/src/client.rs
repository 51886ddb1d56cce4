//! The generation-backend seam.
//!
//! [`GenerationClient`] is everything the compactor and the turn pipeline
//! need from a language model provider: a stateless `generate` over an
//! explicit history, and (for providers that keep server-side state) a
//! `compact_response` keyed by a previous response id. The reqwest-backed
//! implementations live in [`crate::api`].

use crate::ToolDef;
use crate::Turn;
use crate::ledger::UsageReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`GenerationClient`] methods.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// What a client can do, fixed for the client's lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// The provider keeps conversation state addressable by response id and
    /// exposes a native compact endpoint for it.
    pub stateful_responses: bool,
}

impl ClientCapabilities {
    pub fn stateless() -> Self {
        Self {
            stateful_responses: false,
        }
    }

    pub fn stateful() -> Self {
        Self {
            stateful_responses: true,
        }
    }
}

/// Who a turn is running for, forwarded to tool-aware backends.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub owner_id: Option<String>,
    pub channel: Option<String>,
}

/// One stateless generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    /// Prior turns, oldest first. Excludes `user_message`.
    pub history: &'a [Turn],
    /// The new user message text.
    pub user_message: &'a str,
    /// Rich user content (e.g. image parts) replacing `user_message` on the wire.
    pub user_content: Option<Value>,
    pub tools: &'a [ToolDef],
    pub tool_context: Option<ToolContext>,
    /// JSON Schema the response payload should follow.
    pub response_schema: Option<Value>,
    pub prompt_cache_key: Option<&'a str>,
    pub previous_response_id: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(history: &'a [Turn], user_message: &'a str) -> Self {
        Self {
            history,
            user_message,
            user_content: None,
            tools: &[],
            tool_context: None,
            response_schema: None,
            prompt_cache_key: None,
            previous_response_id: None,
            system_prompt: None,
        }
    }

    pub fn with_user_content(mut self, content: Value) -> Self {
        self.user_content = Some(content);
        self
    }

    pub fn with_tools(mut self, tools: &'a [ToolDef]) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_context(mut self, context: ToolContext) -> Self {
        self.tool_context = Some(context);
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_prompt_cache_key(mut self, key: &'a str) -> Self {
        self.prompt_cache_key = Some(key);
        self
    }

    pub fn with_previous_response_id(mut self, id: Option<&'a str>) -> Self {
        self.previous_response_id = id;
        self
    }

    pub fn with_system_prompt(mut self, prompt: &'a str) -> Self {
        self.system_prompt = Some(prompt);
        self
    }
}

/// Result of a successful [`GenerationClient::generate`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    /// Provider output: a string, or a parsed JSON value when the provider
    /// returned structured output.
    pub payload: Value,
    /// Provider-assigned id for stateful continuation, if any.
    pub response_id: Option<String>,
    pub total_tokens: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub reasoning_output_tokens: Option<i64>,
}

impl Generation {
    /// Usage fields in the shape [`SessionLedger::track_usage`](crate::ledger::SessionLedger::track_usage) takes.
    pub fn usage(&self) -> UsageReport {
        UsageReport {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            cached_input_tokens: self.cached_input_tokens,
            reasoning_output_tokens: self.reasoning_output_tokens,
        }
    }
}

/// Result of a successful [`GenerationClient::compact_response`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeCompaction {
    /// Id of the compacted response; continuation should chain from it.
    pub response_id: String,
    /// Raw output items. Message items carry `content: [{ "text": ... }]`.
    pub output: Vec<Value>,
    pub total_tokens: Option<i64>,
}

/// A language model backend.
///
/// Implementations must be dyn-compatible; all async methods return boxed
/// futures.
pub trait GenerationClient: Send + Sync {
    /// Static description of the backend.
    fn capabilities(&self) -> ClientCapabilities;

    fn supports_stateful_responses(&self) -> bool {
        self.capabilities().stateful_responses
    }

    /// Run one completion over `request.history` plus the new user message.
    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> ClientFuture<'a, Generation>;

    /// Ask the provider to compact the server-side conversation ending at
    /// `previous_response_id`.
    fn compact_response<'a>(
        &'a self,
        previous_response_id: &'a str,
        prompt_cache_key: Option<&'a str>,
    ) -> ClientFuture<'a, NativeCompaction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders_set_fields() {
        let history = vec![Turn::user("hi")];
        let req = GenerationRequest::new(&history, "next")
            .with_prompt_cache_key("s1:compact")
            .with_previous_response_id(Some("resp-1"))
            .with_system_prompt("sys");
        assert_eq!(req.history.len(), 1);
        assert_eq!(req.user_message, "next");
        assert_eq!(req.prompt_cache_key, Some("s1:compact"));
        assert_eq!(req.previous_response_id, Some("resp-1"));
        assert_eq!(req.system_prompt, Some("sys"));
        assert!(req.tools.is_empty());
        assert!(req.response_schema.is_none());
        assert!(req.user_content.is_none());
    }

    #[test]
    fn generation_usage_maps_fields() {
        let generation = Generation {
            payload: Value::String("ok".into()),
            total_tokens: Some(30),
            input_tokens: Some(20),
            output_tokens: Some(10),
            cached_input_tokens: Some(5),
            reasoning_output_tokens: None,
            response_id: None,
        };
        let usage = generation.usage();
        assert_eq!(usage.total_tokens, Some(30));
        assert_eq!(usage.cached_input_tokens, Some(5));
        assert_eq!(usage.reasoning_output_tokens, None);
    }

    #[test]
    fn capabilities_constructors() {
        assert!(ClientCapabilities::stateful().stateful_responses);
        assert!(!ClientCapabilities::stateless().stateful_responses);
        assert_eq!(ClientCapabilities::default(), ClientCapabilities::stateless());
    }
}
