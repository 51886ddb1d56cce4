//! Stateless chat completions backend (OpenRouter-compatible).

use super::retry::{RetryConfig, with_retry};
use super::usage::usage_from_payload;
use crate::ToolDef;
use crate::client::{
    ClientCapabilities, ClientFuture, Generation, GenerationClient, GenerationRequest,
    NativeCompaction,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// OpenRouter chat completions endpoint.
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Serialize, Debug)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDef]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Serialize, Debug)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<Value>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Chat completions client. Keeps no server-side state, so native
/// compaction is unavailable and every call carries the full history.
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    referer: String,
    title: String,
    retry: RetryConfig,
}

impl ChatCompletionsClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("cinch-memory/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            url: OPENROUTER_URL.to_string(),
            referer: "https://github.com/tacryt-socryp/cinch-rs".to_string(),
            title: "cinch-memory".to_string(),
            retry: RetryConfig::default(),
        })
    }

    /// Point at a different chat completions endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body<'a>(&'a self, request: &GenerationRequest<'a>) -> ChatBody<'a> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = request.system_prompt.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::new("system", system));
        }
        for turn in request.history {
            let role = match turn.role {
                crate::TurnRole::User => "user",
                crate::TurnRole::Assistant => "assistant",
            };
            messages.push(ChatMessage::new(role, turn.content.as_str()));
        }
        let user = request
            .user_content
            .clone()
            .unwrap_or_else(|| Value::String(request.user_message.to_string()));
        messages.push(ChatMessage::new("user", user));

        ChatBody {
            model: &self.model,
            messages,
            tools: (!request.tools.is_empty()).then_some(request.tools),
            response_format: request.response_schema.as_ref().map(|schema| {
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": "answer", "schema": schema}
                })
            }),
            user: request
                .tool_context
                .as_ref()
                .and_then(|ctx| ctx.owner_id.clone()),
        }
    }

    async fn send(&self, body: &ChatBody<'_>) -> Result<Value, String> {
        debug!(
            "Chat request: model={}, messages={}, tools={}",
            body.model,
            body.messages.len(),
            body.tools.map_or(0, <[ToolDef]>::len)
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
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
            "Chat response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("chat completions HTTP {status}: {text}"));
        }
        serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))
    }
}

/// Pull the first choice's text out of a chat completions body.
fn parse_completion(body: Value) -> Result<Generation, String> {
    if let Some(message) = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(format!("chat completions API error: {message}"));
    }
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| "chat completions returned no message content".to_string())?;

    let usage = usage_from_payload(&body);
    Ok(Generation {
        payload: Value::String(content.to_string()),
        response_id: None,
        total_tokens: usage.total_tokens,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_input_tokens: usage.cached_input_tokens,
        reasoning_output_tokens: usage.reasoning_output_tokens,
    })
}

impl GenerationClient for ChatCompletionsClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::stateless()
    }

    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> ClientFuture<'a, Generation> {
        Box::pin(async move {
            let body = self.build_body(&request);
            let raw = with_retry(&self.retry, "chat completion", || self.send(&body)).await?;
            parse_completion(raw)
        })
    }

    fn compact_response<'a>(
        &'a self,
        _previous_response_id: &'a str,
        _prompt_cache_key: Option<&'a str>,
    ) -> ClientFuture<'a, NativeCompaction> {
        Box::pin(async {
            Err("native compaction is not supported by the chat completions client".to_string())
        })
    }
}
