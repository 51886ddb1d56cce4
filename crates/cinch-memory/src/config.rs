//! File-backed configuration for the memory controller.
//!
//! [`MemoryConfig`] is the JSON shape of a deployment's settings. It
//! converts into the library's own types via
//! [`build_compaction_config`](MemoryConfig::build_compaction_config),
//! [`build_turn_config`](MemoryConfig::build_turn_config),
//! [`build_prompt_composer`](MemoryConfig::build_prompt_composer) and
//! [`build_client`](MemoryConfig::build_client).

use crate::api::{ChatCompletionsClient, ResponsesClient, RetryConfig};
use crate::client::GenerationClient;
use crate::compaction::{COMPACTION_REQUEST, CompactionConfig, StateMode};
use crate::prompt::DefaultPromptComposer;
use crate::turn::TurnConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Which HTTP backend to talk to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenRouter chat completions. Stateless.
    #[default]
    Chat,
    /// OpenAI Responses API. Stateful, with native compaction.
    Responses,
}

impl ProviderKind {
    /// Environment variable holding this provider's API key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            ProviderKind::Chat => "OPENROUTER_KEY",
            ProviderKind::Responses => "OPENAI_API_KEY",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "openrouter" => Ok(ProviderKind::Chat),
            "responses" | "openai_responses" => Ok(ProviderKind::Responses),
            other => Err(format!("Unknown provider '{other}' (expected chat or responses)")),
        }
    }
}

/// Deployment settings. Every field has a default, so `{}` is a valid file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub provider: ProviderKind,
    /// Model identifier. Default depends on `provider` when unset.
    pub model: Option<String>,
    /// Override the provider endpoint (chat: full URL; responses: base URL).
    pub base_url: Option<String>,
    pub system_prompt: String,
    /// Token ceiling per session; unset disables compaction.
    pub max_history_tokens: Option<u64>,
    pub max_history_messages: Option<usize>,
    pub notify_compaction_updates: bool,
    pub state_mode: StateMode,
    pub prompt_cache_enabled: bool,
    pub structured_output: bool,
    pub prompts_dir: Option<PathBuf>,
    pub compaction_request: String,
    /// Retries for transient provider errors.
    pub max_retries: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: None,
            base_url: None,
            system_prompt: "You are a helpful assistant.".to_string(),
            max_history_tokens: None,
            max_history_messages: None,
            notify_compaction_updates: false,
            state_mode: StateMode::default(),
            prompt_cache_enabled: true,
            structured_output: true,
            prompts_dir: None,
            compaction_request: COMPACTION_REQUEST.to_string(),
            max_retries: 2,
        }
    }
}

impl MemoryConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
        serde_json::from_str(&json)
            .map_err(|e| format!("Failed to parse config {}: {e}", path.display()))
    }

    /// Model to use, falling back to a per-provider default.
    pub fn resolved_model(&self) -> &str {
        match (&self.model, self.provider) {
            (Some(model), _) => model,
            (None, ProviderKind::Chat) => "openai/gpt-4o-mini",
            (None, ProviderKind::Responses) => "gpt-4.1-mini",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        self.provider.api_key_env()
    }

    pub fn build_compaction_config(&self) -> CompactionConfig {
        let mut config = CompactionConfig::default().with_request_text(&self.compaction_request);
        config.max_history_tokens = self.max_history_tokens;
        config
    }

    pub fn build_turn_config(&self) -> TurnConfig {
        let mut config = TurnConfig::new(&self.system_prompt)
            .with_notify_compaction_updates(self.notify_compaction_updates)
            .with_state_mode(self.state_mode)
            .with_prompt_cache(self.prompt_cache_enabled)
            .with_structured_output(self.structured_output);
        config.max_history_messages = self.max_history_messages;
        config
    }

    pub fn build_prompt_composer(&self) -> DefaultPromptComposer {
        match &self.prompts_dir {
            Some(dir) => DefaultPromptComposer::with_prompts_dir(dir),
            None => DefaultPromptComposer::new(),
        }
    }

    /// Build the HTTP client for `provider`.
    pub fn build_client(&self, api_key: &str) -> Result<Arc<dyn GenerationClient>, String> {
        let retry = RetryConfig::with_retries(self.max_retries);
        let model = self.resolved_model();
        match self.provider {
            ProviderKind::Chat => {
                let mut client = ChatCompletionsClient::new(api_key, model)?.with_retry(retry);
                if let Some(url) = &self.base_url {
                    client = client.with_url(url);
                }
                Ok(Arc::new(client))
            }
            ProviderKind::Responses => {
                let mut client = ResponsesClient::new(api_key, model)?
                    .with_retry(retry)
                    .with_prompt_cache(self.prompt_cache_enabled);
                if let Some(url) = &self.base_url {
                    client = client.with_base_url(url);
                }
                Ok(Arc::new(client))
            }
        }
    }
}
