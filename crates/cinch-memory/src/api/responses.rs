//! OpenAI Responses API backend.
//!
//! The Responses API keeps conversation state on the server. A request that
//! names a `previous_response_id` continues from that response, so only the
//! new user input is sent. `POST /responses/compact` shrinks that server-side
//! state in place and returns a fresh response id to chain from.

use super::retry::{RetryConfig, with_retry};
use super::usage::usage_from_payload;
use crate::client::{
    ClientCapabilities, ClientFuture, Generation, GenerationClient, GenerationRequest,
    NativeCompaction,
};
use crate::{ToolDef, TurnRole};
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tracing::debug;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Responses API client with native compaction.
pub struct ResponsesClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    prompt_cache_enabled: bool,
    retry: RetryConfig,
}

impl ResponsesClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("cinch-memory/0.1")
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            prompt_cache_enabled: true,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// When disabled, `prompt_cache_key` is never sent.
    pub fn with_prompt_cache(mut self, enabled: bool) -> Self {
        self.prompt_cache_enabled = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn cache_key<'a>(&self, key: Option<&'a str>) -> Option<&'a str> {
        key.filter(|k| self.prompt_cache_enabled && !k.is_empty())
    }

    fn build_body(&self, request: &GenerationRequest<'_>) -> Value {
        let previous = request.previous_response_id.filter(|id| !id.is_empty());

        let mut input = Vec::new();
        if previous.is_none() {
            for turn in request.history {
                let role = match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                };
                input.push(json!({"role": role, "content": turn.content}));
            }
        }
        let user = request
            .user_content
            .clone()
            .unwrap_or_else(|| Value::String(request.user_message.to_string()));
        input.push(json!({"role": "user", "content": user}));

        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("input".into(), Value::Array(input));
        if let Some(system) = request.system_prompt.filter(|s| !s.is_empty()) {
            body.insert("instructions".into(), json!(system));
        }
        if let Some(id) = previous {
            body.insert("previous_response_id".into(), json!(id));
        }
        if let Some(key) = self.cache_key(request.prompt_cache_key) {
            body.insert("prompt_cache_key".into(), json!(key));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(flatten_tool).collect();
            body.insert("tools".into(), Value::Array(tools));
        }
        if let Some(schema) = &request.response_schema {
            body.insert(
                "text".into(),
                json!({"format": {"type": "json_schema", "name": "answer", "schema": schema}}),
            );
        }
        if let Some(ctx) = &request.tool_context {
            let mut metadata = Map::new();
            if let Some(owner) = &ctx.owner_id {
                metadata.insert("owner_id".into(), json!(owner));
            }
            if let Some(channel) = &ctx.channel {
                metadata.insert("channel".into(), json!(channel));
            }
            if !metadata.is_empty() {
                body.insert("metadata".into(), Value::Object(metadata));
            }
        }
        Value::Object(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, String> {
        let url = format!("{}{path}", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "Responses API {path}: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );
        if !status.is_success() {
            return Err(format!("Responses API HTTP {status}: {text}"));
        }
        serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))
    }
}

/// Responses tools are flat: `{type, name, description, parameters}`.
fn flatten_tool(tool: &ToolDef) -> Value {
    json!({
        "type": "function",
        "name": tool.function.name,
        "description": tool.function.description,
        "parameters": tool.function.parameters,
    })
}

/// Concatenate every `text` of every content entry of every output item.
pub(crate) fn output_text(output: &[Value]) -> String {
    output
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

fn parse_response(body: Value) -> Result<Generation, String> {
    if let Some(message) = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(format!("Responses API error: {message}"));
    }
    let output = body
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let text = output_text(output);
    let usage = usage_from_payload(&body);
    Ok(Generation {
        payload: Value::String(text),
        response_id: body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        total_tokens: usage.total_tokens,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_input_tokens: usage.cached_input_tokens,
        reasoning_output_tokens: usage.reasoning_output_tokens,
    })
}

fn parse_compaction(body: Value) -> Result<NativeCompaction, String> {
    let response_id = body
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "responses compact endpoint returned payload without id".to_string())?
        .to_string();
    let total_tokens = usage_from_payload(&body).total_tokens;
    let output = match body.get("output") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    Ok(NativeCompaction {
        response_id,
        output,
        total_tokens,
    })
}

impl GenerationClient for ResponsesClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::stateful()
    }

    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> ClientFuture<'a, Generation> {
        Box::pin(async move {
            let body = self.build_body(&request);
            let raw = with_retry(&self.retry, "responses request", || {
                self.post("/responses", &body)
            })
            .await?;
            parse_response(raw)
        })
    }

    fn compact_response<'a>(
        &'a self,
        previous_response_id: &'a str,
        prompt_cache_key: Option<&'a str>,
    ) -> ClientFuture<'a, NativeCompaction> {
        Box::pin(async move {
            let mut body = json!({
                "model": self.model,
                "previous_response_id": previous_response_id,
            });
            if let Some(key) = self.cache_key(prompt_cache_key) {
                body["prompt_cache_key"] = json!(key);
            }
            let raw = with_retry(&self.retry, "responses compact request", || {
                self.post("/responses/compact", &body)
            })
            .await?;
            parse_compaction(raw)
        })
    }
}
