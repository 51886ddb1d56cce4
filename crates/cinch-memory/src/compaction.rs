//! Token-budgeted history compaction.
//!
//! [`HistoryCompactor::compact_if_needed`] compares a session's cumulative
//! token total against the configured ceiling. Once the total reaches the
//! ceiling, the session's stored history is replaced by two turns:
//!
//! ```text
//! user:      Please compact the current conversation memory.
//! assistant: <summary>
//! ```
//!
//! and the ledger total is reset to zero. The summary comes from one of two
//! strategies, tried in order:
//!
//! 1. **Native**: the provider's stateful compact endpoint, addressed by the
//!    session's previous response id. Eligible only when the client
//!    advertises stateful responses, the state mode is
//!    [`StateMode::PreviousResponseId`], and the session has a handle. Any
//!    failure is logged and falls through.
//! 2. **Summary**: a stateless generation over the full history with the
//!    compaction system prompt.
//!
//! Compaction never returns an error. Failures are logged and reported
//! through [`CompactionOutcome`] with `performed == false`.

use crate::answer::{AnswerExtractor, StructuredAnswerExtractor};
use crate::client::{ClientCapabilities, GenerationClient, GenerationRequest};
use crate::history::HistoryStore;
use crate::ledger::SessionLedger;
use crate::locks::{SessionGuard, SessionLocks};
use crate::prompt::{DefaultPromptComposer, PromptComposer};
use crate::{Turn, TurnRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// User turn recorded in place of the compacted history.
pub const COMPACTION_REQUEST: &str = "Please compact the current conversation memory.";
/// Appended to the turn's cache-key prefix for compaction calls.
pub const COMPACT_CACHE_SUFFIX: &str = ":compact";
/// Summary used when native compaction returns no text.
pub const DEFAULT_COMPACTED_TEXT: &str = "Conversation compacted.";

pub const UPDATE_RUNNING: &str = "running compaction...";
pub const UPDATE_DONE: &str = "done compacting";
pub const UPDATE_ERROR: &str = "error compacting";

// ── State mode ─────────────────────────────────────────────────────

/// How conversation state is carried between turns.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateMode {
    /// Every request carries the full stored history.
    #[default]
    FullMessages,
    /// Requests chain from the provider's previous response id.
    PreviousResponseId,
}

impl StateMode {
    pub fn is_handle_based(self) -> bool {
        matches!(self, StateMode::PreviousResponseId)
    }
}

impl std::fmt::Display for StateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateMode::FullMessages => write!(f, "full_messages"),
            StateMode::PreviousResponseId => write!(f, "previous_response_id"),
        }
    }
}

impl FromStr for StateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_messages" => Ok(StateMode::FullMessages),
            "previous_response_id" => Ok(StateMode::PreviousResponseId),
            other => Err(format!(
                "Unknown state mode '{other}' (expected full_messages or previous_response_id)"
            )),
        }
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Compactor settings.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Token ceiling. `None` disables compaction entirely.
    pub max_history_tokens: Option<u64>,
    /// Text of the user turn that precedes the summary.
    pub request_text: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_history_tokens: None,
            request_text: COMPACTION_REQUEST.to_string(),
        }
    }
}

impl CompactionConfig {
    pub fn with_max_history_tokens(mut self, tokens: u64) -> Self {
        self.max_history_tokens = Some(tokens);
        self
    }

    pub fn with_request_text(mut self, text: impl Into<String>) -> Self {
        self.request_text = text.into();
        self
    }
}

/// Per-call inputs to [`HistoryCompactor::compact_if_needed`].
#[derive(Debug, Clone, Copy)]
pub struct CompactionRequest<'a> {
    pub session_key: &'a str,
    /// Turn cache key; compaction calls use `"{prefix}:compact"`.
    pub cache_key_prefix: &'a str,
    /// System prompt of the turn, extended with the compaction instruction.
    pub system_prompt: &'a str,
    /// Collect human-readable status updates.
    pub notify: bool,
    pub state_mode: StateMode,
}

impl<'a> CompactionRequest<'a> {
    pub fn new(session_key: &'a str, cache_key_prefix: &'a str, system_prompt: &'a str) -> Self {
        Self {
            session_key,
            cache_key_prefix,
            system_prompt,
            notify: false,
            state_mode: StateMode::default(),
        }
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_state_mode(mut self, mode: StateMode) -> Self {
        self.state_mode = mode;
        self
    }
}

// ── Outcomes ───────────────────────────────────────────────────────

/// What a compaction check did.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Status strings, only collected when notifications were requested.
    pub updates: Vec<String>,
    pub performed: bool,
    /// Tokens consumed by compaction calls themselves.
    pub tokens_used: u64,
    /// Session total just before the reset; `None` when no reset happened.
    pub session_total_tokens_before_compaction: Option<u64>,
    pub session_total_tokens_after_compaction: u64,
}

impl CompactionOutcome {
    fn unchanged(updates: Vec<String>, tokens_used: u64, current: u64) -> Self {
        Self {
            updates,
            performed: false,
            tokens_used,
            session_total_tokens_before_compaction: None,
            session_total_tokens_after_compaction: current,
        }
    }
}

/// A successful strategy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compacted {
    pub summary: String,
    pub tokens_used: u64,
    /// Session total before the call's own tokens were added.
    pub tokens_before: u64,
}

/// Result of one strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    NativeSuccess(Compacted),
    /// Native compaction failed; the summary strategy runs next.
    NativeRecoverableFailure { error: String, tokens_used: u64 },
    FallbackSuccess(Compacted),
    FallbackFatalFailure { error: String, tokens_used: u64 },
}

/// Concatenated, trimmed text of every content part of every output item.
pub fn extract_compaction_text(output: &[Value]) -> String {
    let text: String = output
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect();
    text.trim().to_string()
}

// ── HistoryCompactor ───────────────────────────────────────────────

/// Decides when a session's history must shrink and performs the shrink.
pub struct HistoryCompactor {
    history: Arc<dyn HistoryStore>,
    client: Arc<dyn GenerationClient>,
    ledger: Arc<SessionLedger>,
    prompts: Arc<dyn PromptComposer>,
    answers: Arc<dyn AnswerExtractor>,
    capabilities: ClientCapabilities,
    locks: Arc<SessionLocks>,
    config: CompactionConfig,
}

impl HistoryCompactor {
    /// Build a compactor. The client's capabilities are read once here.
    pub fn new(
        history: Arc<dyn HistoryStore>,
        client: Arc<dyn GenerationClient>,
        ledger: Arc<SessionLedger>,
        config: CompactionConfig,
    ) -> Self {
        let capabilities = client.capabilities();
        Self {
            history,
            client,
            ledger,
            prompts: Arc::new(DefaultPromptComposer::new()),
            answers: Arc::new(StructuredAnswerExtractor::new()),
            capabilities,
            locks: Arc::new(SessionLocks::new()),
            config,
        }
    }

    pub fn with_prompt_composer(mut self, prompts: Arc<dyn PromptComposer>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_answer_extractor(mut self, answers: Arc<dyn AnswerExtractor>) -> Self {
        self.answers = answers;
        self
    }

    /// Override the capabilities captured from the client.
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Share a lock registry with other writers of the same sessions.
    pub fn with_session_locks(mut self, locks: Arc<SessionLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn client(&self) -> &Arc<dyn GenerationClient> {
        &self.client
    }

    pub fn ledger(&self) -> &Arc<SessionLedger> {
        &self.ledger
    }

    pub fn prompts(&self) -> &Arc<dyn PromptComposer> {
        &self.prompts
    }

    pub fn answers(&self) -> &Arc<dyn AnswerExtractor> {
        &self.answers
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn supports_stateful_responses(&self) -> bool {
        self.capabilities.stateful_responses
    }

    /// Take exclusive access to a session for a multi-step update.
    pub async fn lock_session(&self, session_key: &str) -> SessionGuard {
        self.locks.acquire(session_key).await
    }

    /// Compact the session if it is at or over budget, holding the session
    /// lock for the whole operation.
    pub async fn compact_if_needed(&self, request: CompactionRequest<'_>) -> CompactionOutcome {
        let _guard = self.locks.acquire(request.session_key).await;
        self.run(request).await
    }

    /// Like [`compact_if_needed`](Self::compact_if_needed) for callers that
    /// already hold the session's guard.
    pub async fn compact_held(
        &self,
        guard: &SessionGuard,
        request: CompactionRequest<'_>,
    ) -> CompactionOutcome {
        if guard.session_key() != request.session_key {
            error!(
                "Compaction for session {} refused: guard belongs to session {}",
                request.session_key,
                guard.session_key()
            );
            return CompactionOutcome::unchanged(
                Vec::new(),
                0,
                self.ledger.current_tokens(request.session_key),
            );
        }
        if !self.locks.holds(guard) {
            error!(
                "Compaction for session {} refused: guard was issued by another lock registry",
                request.session_key
            );
            return CompactionOutcome::unchanged(
                Vec::new(),
                0,
                self.ledger.current_tokens(request.session_key),
            );
        }
        self.run(request).await
    }

    async fn run(&self, request: CompactionRequest<'_>) -> CompactionOutcome {
        let key = request.session_key;
        let total = self.ledger.current_tokens(key);
        let Some(ceiling) = self.config.max_history_tokens else {
            return CompactionOutcome::unchanged(Vec::new(), 0, total);
        };
        if total < ceiling {
            return CompactionOutcome::unchanged(Vec::new(), 0, total);
        }

        let mut updates = Vec::new();
        let history = match self.history.fetch(key).await {
            Ok(history) => history,
            Err(e) => {
                error!("History compaction failed for session {key}: {e}");
                if request.notify {
                    updates.push(UPDATE_ERROR.to_string());
                }
                return CompactionOutcome::unchanged(updates, 0, total);
            }
        };

        if history.is_empty() {
            debug!("Session {key} is over budget with no history; resetting {total} tokens");
            self.ledger.reset_tokens(key);
            return CompactionOutcome {
                updates,
                performed: false,
                tokens_used: 0,
                session_total_tokens_before_compaction: Some(total),
                session_total_tokens_after_compaction: 0,
            };
        }

        if request.notify {
            updates.push(UPDATE_RUNNING.to_string());
        }
        info!(
            "Session {key} reached {total}/{ceiling} tokens; compacting {} turn(s)",
            history.len()
        );

        match self.select_strategy(&request, &history).await {
            StrategyOutcome::NativeSuccess(done) | StrategyOutcome::FallbackSuccess(done) => {
                if request.notify {
                    updates.push(UPDATE_DONE.to_string());
                    updates.push(done.summary.clone());
                }
                CompactionOutcome {
                    updates,
                    performed: true,
                    tokens_used: done.tokens_used,
                    session_total_tokens_before_compaction: Some(done.tokens_before),
                    session_total_tokens_after_compaction: 0,
                }
            }
            StrategyOutcome::NativeRecoverableFailure { error, tokens_used }
            | StrategyOutcome::FallbackFatalFailure { error, tokens_used } => {
                error!("History compaction failed for session {key}: {error}");
                if request.notify {
                    updates.push(UPDATE_ERROR.to_string());
                }
                CompactionOutcome::unchanged(updates, tokens_used, self.ledger.current_tokens(key))
            }
        }
    }

    /// Native first when eligible, then the summary strategy. Only returns
    /// a success or a fatal failure.
    async fn select_strategy(
        &self,
        request: &CompactionRequest<'_>,
        history: &[Turn],
    ) -> StrategyOutcome {
        let cache_key = format!("{}{COMPACT_CACHE_SUFFIX}", request.cache_key_prefix);
        let mut carried_tokens = 0;

        if let Some(native) = self.compact_native(request, &cache_key).await {
            match native {
                StrategyOutcome::NativeRecoverableFailure { error, tokens_used } => {
                    warn!(
                        "Native compaction failed for session {}; falling back to summary compaction: {error}",
                        request.session_key
                    );
                    carried_tokens = tokens_used;
                }
                done => return done,
            }
        }

        self.compact_summary(request, history, &cache_key, carried_tokens)
            .await
    }

    /// `None` when the session is not eligible for native compaction.
    async fn compact_native(
        &self,
        request: &CompactionRequest<'_>,
        cache_key: &str,
    ) -> Option<StrategyOutcome> {
        let key = request.session_key;
        if !self.capabilities.stateful_responses || !request.state_mode.is_handle_based() {
            return None;
        }
        let handle = self.ledger.previous_response_id(key)?;

        let compacted = match self.client.compact_response(&handle, Some(cache_key)).await {
            Ok(compacted) => compacted,
            Err(error) => {
                return Some(StrategyOutcome::NativeRecoverableFailure {
                    error,
                    tokens_used: 0,
                });
            }
        };

        let mut summary = extract_compaction_text(&compacted.output);
        if summary.is_empty() {
            summary = DEFAULT_COMPACTED_TEXT.to_string();
        }
        let tokens_before = self.ledger.current_tokens(key);
        let tokens_used = self.ledger.track_tokens(key, compacted.total_tokens);

        if let Err(error) = self.replace_history(key, &summary).await {
            return Some(StrategyOutcome::NativeRecoverableFailure { error, tokens_used });
        }
        self.ledger.reset_tokens(key);
        self.ledger
            .set_previous_response_id(key, &compacted.response_id);
        info!("Session {key} compacted natively ({tokens_used} tokens)");

        Some(StrategyOutcome::NativeSuccess(Compacted {
            summary,
            tokens_used,
            tokens_before,
        }))
    }

    async fn compact_summary(
        &self,
        request: &CompactionRequest<'_>,
        history: &[Turn],
        cache_key: &str,
        carried_tokens: u64,
    ) -> StrategyOutcome {
        let key = request.session_key;
        let system_prompt = self.prompts.compact_system_prompt(request.system_prompt);
        let generation_request = GenerationRequest::new(history, &self.config.request_text)
            .with_prompt_cache_key(cache_key)
            .with_system_prompt(&system_prompt);

        let generation = match self.client.generate(generation_request).await {
            Ok(generation) => generation,
            Err(error) => {
                return StrategyOutcome::FallbackFatalFailure {
                    error,
                    tokens_used: carried_tokens,
                };
            }
        };

        let tokens_before = self.ledger.current_tokens(key);
        let tokens_used = self.ledger.track_tokens(key, generation.total_tokens);
        let summary = self.answers.extract_answer(&generation.payload).text;

        if let Err(error) = self.replace_history(key, &summary).await {
            return StrategyOutcome::FallbackFatalFailure { error, tokens_used };
        }
        self.ledger.reset_tokens(key);
        if request.state_mode.is_handle_based() {
            match generation.response_id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => self.ledger.set_previous_response_id(key, id),
                None => self.ledger.clear_previous_response_id(key),
            }
        }
        info!("Session {key} compacted by summary ({tokens_used} tokens)");

        StrategyOutcome::FallbackSuccess(Compacted {
            summary,
            tokens_used,
            tokens_before,
        })
    }

    /// Trim to empty, then append the request and summary turns.
    async fn replace_history(&self, key: &str, summary: &str) -> Result<(), String> {
        self.history.trim(key, 0).await?;
        self.history
            .append(key, TurnRole::User, &self.config.request_text)
            .await?;
        self.history
            .append(key, TurnRole::Assistant, summary)
            .await
    }
}
