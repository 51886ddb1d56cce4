//! Token-budgeted conversation memory for LLM chat sessions.
//!
//! `cinch-memory` keeps a per-session token ledger and, once a session's
//! cumulative usage crosses a configured ceiling, replaces its stored turn
//! history with a single compacted summary produced by the generation
//! backend. Two interchangeable strategies are tried in order:
//!
//! 1. **Native compaction** — the provider's stateful compact endpoint,
//!    addressed by the session's previous response id. Only used when the
//!    client advertises stateful responses and the session runs in
//!    [`StateMode::PreviousResponseId`](compaction::StateMode::PreviousResponseId).
//! 2. **Summary compaction** — a stateless completion over the full history
//!    with a compaction-specific system prompt.
//!
//! Either way the history ends up as exactly two turns (the fixed
//! compaction request and the summary) and the session's token total is
//! reset to zero.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use cinch_memory::prelude::*;
//!
//! let client: Arc<dyn GenerationClient> = Arc::new(ChatCompletionsClient::new(api_key, "openai/gpt-4o-mini")?);
//! let compactor = HistoryCompactor::new(
//!     Arc::new(InMemoryHistory::new()),
//!     client,
//!     Arc::new(SessionLedger::new()),
//!     CompactionConfig::default().with_max_history_tokens(50_000),
//! );
//!
//! let runner = TurnRunner::new(compactor, TurnConfig::new("You are a helpful assistant."));
//! let report = runner.run_turn("telegram:42", "What did we decide yesterday?").await?;
//! println!("{}", report.answer);
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`ledger`] | [`SessionLedger`](ledger::SessionLedger): cumulative tokens, usage snapshot, previous response id, token traces |
//! | [`locks`] | [`SessionLocks`](locks::SessionLocks): one writer per session key |
//! | [`compaction`] | [`HistoryCompactor`](compaction::HistoryCompactor): the budget check and both compaction strategies |
//! | [`history`] | [`HistoryStore`](history::HistoryStore) trait, in-memory and JSON-file stores |
//! | [`client`] | [`GenerationClient`](client::GenerationClient) trait and request/response types |
//! | [`api`] | reqwest-backed chat-completions and Responses API clients, retry, usage parsing |
//! | [`prompt`] | Compaction system-prompt composition |
//! | [`answer`] | Structured answer extraction from generation payloads |
//! | [`turn`] | [`TurnRunner`](turn::TurnRunner): a full chat turn around the compactor |
//! | [`config`] | [`MemoryConfig`](config::MemoryConfig): file/CLI configuration |

pub mod answer;
pub mod api;
pub mod client;
pub mod compaction;
pub mod config;
pub mod history;
pub mod ledger;
pub mod locks;
pub mod prelude;
pub mod prompt;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Turn types ─────────────────────────────────────────────────────

/// Role of a stored turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged message in a session's history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition forwarded to the generation backend (OpenAI
/// function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_constructors() {
        let user = Turn::user("hello");
        assert_eq!(user.role, TurnRole::User);
        assert_eq!(user.content, "hello");

        let assistant = Turn::assistant("hi there");
        assert_eq!(assistant.role, TurnRole::Assistant);
    }

    #[test]
    fn turn_role_serializes_lowercase() {
        let json = serde_json::to_string(&TurnRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        assert_eq!(TurnRole::User.to_string(), "user");
    }

    #[test]
    fn tool_def_uses_function_format() {
        let def = ToolDef::new("lookup", "Look something up", serde_json::json!({"type": "object"}));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "lookup");
    }
}
