//! A full chat turn around the compactor.
//!
//! [`TurnRunner::run_turn`] is what a bot handler does with one incoming
//! message: record it, ask the model, record the answer, account for the
//! tokens, and compact the session if it went over budget. The whole turn
//! holds the session's lock, so compaction never interleaves with another
//! turn on the same session.

use crate::ToolDef;
use crate::answer::{AnswerKind, RenderedAnswer, answer_schema};
use crate::client::{GenerationRequest, ToolContext};
use crate::compaction::{CompactionOutcome, CompactionRequest, HistoryCompactor, StateMode};
use crate::ledger::{SessionLedger, TokenTrace, UsageSnapshot};
use crate::locks::SessionGuard;
use crate::TurnRole;
use serde::Serialize;
use tracing::{debug, error};

/// Answer text used when the generation call fails.
pub const GENERATION_FAILED_ANSWER: &str = "Sorry, I couldn't answer right now.";

/// Settings applied to every turn.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub system_prompt: String,
    /// Keep at most this many stored turns after each append.
    pub max_history_messages: Option<usize>,
    pub notify_compaction_updates: bool,
    pub state_mode: StateMode,
    /// Send the session key as the provider prompt-cache key.
    pub prompt_cache_enabled: bool,
    /// Request the structured answer schema.
    pub structured_output: bool,
    pub tools: Vec<ToolDef>,
}

impl TurnConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_history_messages: None,
            notify_compaction_updates: false,
            state_mode: StateMode::default(),
            prompt_cache_enabled: true,
            structured_output: true,
            tools: Vec::new(),
        }
    }

    pub fn with_max_history_messages(mut self, max: usize) -> Self {
        self.max_history_messages = Some(max);
        self
    }

    pub fn with_notify_compaction_updates(mut self, notify: bool) -> Self {
        self.notify_compaction_updates = notify;
        self
    }

    pub fn with_state_mode(mut self, mode: StateMode) -> Self {
        self.state_mode = mode;
        self
    }

    pub fn with_prompt_cache(mut self, enabled: bool) -> Self {
        self.prompt_cache_enabled = enabled;
        self
    }

    pub fn with_structured_output(mut self, enabled: bool) -> Self {
        self.structured_output = enabled;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }
}

/// Optional per-message context.
#[derive(Debug, Clone, Default)]
pub struct TurnInput<'a> {
    /// Channel name, used for channel-specific prompt fragments.
    pub channel: Option<&'a str>,
    pub owner_id: Option<&'a str>,
}

/// Everything a channel needs to deliver the turn's answer.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub answer: String,
    pub kind: AnswerKind,
    pub should_reply: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compaction_updates: Vec<String>,
    pub token_trace: TokenTrace,
    /// Present only when the provider has reported any usage field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_trace: Option<UsageSnapshot>,
}

/// Runs chat turns against a [`HistoryCompactor`]'s stores and client.
pub struct TurnRunner {
    compactor: HistoryCompactor,
    config: TurnConfig,
}

impl TurnRunner {
    pub fn new(compactor: HistoryCompactor, config: TurnConfig) -> Self {
        Self { compactor, config }
    }

    pub fn compactor(&self) -> &HistoryCompactor {
        &self.compactor
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SessionLedger {
        self.compactor.ledger()
    }

    /// Run one turn with no channel context.
    pub async fn run_turn(&self, session_key: &str, user_text: &str) -> Result<TurnReport, String> {
        self.run_turn_with(session_key, user_text, TurnInput::default())
            .await
    }

    /// Run one turn. Errors are history-store failures only; generation
    /// failures become [`GENERATION_FAILED_ANSWER`].
    pub async fn run_turn_with(
        &self,
        session_key: &str,
        user_text: &str,
        input: TurnInput<'_>,
    ) -> Result<TurnReport, String> {
        let guard = self.compactor.lock_session(session_key).await;
        let history = self.compactor.history();
        let ledger = self.compactor.ledger();

        history.append(session_key, TurnRole::User, user_text).await?;
        self.enforce_history_limit(session_key).await?;

        let mut prior = history.fetch(session_key).await?;
        // The guard is held, so the newest user turn is the one just appended.
        // It travels separately from the history.
        if prior.last().is_some_and(|t| t.role == TurnRole::User) {
            prior.pop();
        }

        let use_handle =
            self.compactor.supports_stateful_responses() && self.config.state_mode.is_handle_based();
        let previous_id = if use_handle {
            ledger.previous_response_id(session_key)
        } else {
            None
        };
        let cache_key = self
            .config
            .prompt_cache_enabled
            .then(|| session_key.to_string());
        let system_prompt = self
            .compactor
            .prompts()
            .compose_system_prompt(&self.config.system_prompt, input.channel);

        let mut request = GenerationRequest::new(&prior, user_text)
            .with_tools(&self.config.tools)
            .with_system_prompt(&system_prompt)
            .with_previous_response_id(previous_id.as_deref());
        if let Some(key) = cache_key.as_deref() {
            request = request.with_prompt_cache_key(key);
        }
        if self.config.structured_output {
            request = request.with_response_schema(answer_schema());
        }
        if input.owner_id.is_some() || input.channel.is_some() {
            request = request.with_tool_context(ToolContext {
                owner_id: input.owner_id.map(str::to_string),
                channel: input.channel.map(str::to_string),
            });
        }

        let mut turn_total_tokens: u64 = 0;
        let rendered = match self.compactor.client().generate(request).await {
            Ok(generation) => {
                ledger.track_usage(session_key, generation.usage());
                turn_total_tokens += ledger.track_tokens(session_key, generation.total_tokens);
                let rendered = self.compactor.answers().extract_answer(&generation.payload);
                if use_handle {
                    if let Some(id) = generation.response_id.as_deref() {
                        ledger.set_previous_response_id(session_key, id);
                    }
                } else {
                    ledger.clear_previous_response_id(session_key);
                }
                debug!(
                    "Answer extracted (kind={}, {} chars, should_reply={})",
                    rendered.kind,
                    rendered.text.len(),
                    rendered.should_reply
                );
                rendered
            }
            Err(e) => {
                error!("Generation failed for session {session_key}: {e}");
                RenderedAnswer::plain(GENERATION_FAILED_ANSWER)
            }
        };

        history
            .append(session_key, TurnRole::Assistant, &rendered.text)
            .await?;
        self.enforce_history_limit(session_key).await?;

        let prefix = cache_key.unwrap_or_else(|| format!("{session_key}:runtime"));
        let compaction = self
            .compact(&guard, session_key, &prefix, &system_prompt)
            .await;
        turn_total_tokens += compaction.tokens_used;

        let token_trace = SessionLedger::build_token_trace(
            i64::try_from(turn_total_tokens).unwrap_or(i64::MAX),
            compaction.session_total_tokens_before_compaction,
            i64::try_from(compaction.session_total_tokens_after_compaction).unwrap_or(i64::MAX),
            compaction.performed,
        );
        let usage = ledger.latest_usage_trace(session_key);

        Ok(TurnReport {
            answer: rendered.text,
            kind: rendered.kind,
            should_reply: rendered.should_reply,
            compaction_updates: compaction.updates,
            token_trace,
            usage_trace: (!usage.is_empty()).then_some(usage),
        })
    }

    async fn compact(
        &self,
        guard: &SessionGuard,
        session_key: &str,
        prefix: &str,
        system_prompt: &str,
    ) -> CompactionOutcome {
        let request = CompactionRequest::new(session_key, prefix, system_prompt)
            .with_notify(self.config.notify_compaction_updates)
            .with_state_mode(self.config.state_mode);
        self.compactor.compact_held(guard, request).await
    }

    async fn enforce_history_limit(&self, session_key: &str) -> Result<(), String> {
        if let Some(max) = self.config.max_history_messages {
            self.compactor.history().trim(session_key, max).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Generation;
    use crate::compaction::{COMPACTION_REQUEST, CompactionConfig, UPDATE_DONE, UPDATE_RUNNING};
    use crate::history::{HistoryStore, InMemoryHistory};
    use crate::testing::ScriptedClient;
    use crate::Turn;
    use serde_json::json;
    use std::sync::Arc;

    const KEY: &str = "telegram:7";

    fn runner(client: Arc<ScriptedClient>, ceiling: Option<u64>, config: TurnConfig) -> (TurnRunner, Arc<InMemoryHistory>) {
        let history = Arc::new(InMemoryHistory::new());
        let mut compaction = CompactionConfig::default();
        compaction.max_history_tokens = ceiling;
        let compactor = HistoryCompactor::new(
            history.clone(),
            client,
            Arc::new(SessionLedger::new()),
            compaction,
        );
        (TurnRunner::new(compactor, config), history)
    }

    fn structured(text: &str, tokens: i64, id: Option<&str>) -> Generation {
        Generation {
            payload: json!({
                "answer": {"kind": "markdown", "content": text},
                "should_answer_to_user": true
            }),
            response_id: id.map(str::to_string),
            total_tokens: Some(tokens),
            input_tokens: Some(tokens - 2),
            output_tokens: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn turn_records_both_sides_and_tokens() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("Hi!", 30, None)));
        let (runner, history) = runner(client.clone(), None, TurnConfig::new("sys"));

        let report = runner.run_turn(KEY, "hello").await.unwrap();

        assert_eq!(report.answer, "Hi!");
        assert_eq!(report.kind, AnswerKind::Markdown);
        assert!(report.should_reply);
        assert!(report.compaction_updates.is_empty());
        assert_eq!(report.token_trace.turn_total_tokens, 30);
        assert_eq!(report.token_trace.session_total_tokens, 30);
        assert!(!report.token_trace.compaction_performed);
        let usage = report.usage_trace.unwrap();
        assert_eq!(usage.input_tokens, Some(28));

        let turns = history.fetch(KEY).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello");
        assert_eq!(turns[1].content, "Hi!");

        let requests = client.requests();
        let sent = &requests[0];
        assert!(sent.history.is_empty());
        assert_eq!(sent.user_message, "hello");
        assert_eq!(sent.prompt_cache_key.as_deref(), Some(KEY));
        assert!(sent.has_response_schema);
        assert_eq!(sent.previous_response_id, None);
    }

    #[tokio::test]
    async fn prior_turns_are_sent_as_history() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("Second.", 5, None)));
        let (runner, history) = runner(client.clone(), None, TurnConfig::new("sys"));
        history
            .seed(KEY, vec![Turn::user("first"), Turn::assistant("First.")])
            .await;

        runner.run_turn(KEY, "second").await.unwrap();

        let requests = client.requests();
        let sent = &requests[0];
        assert_eq!(sent.history.len(), 2);
        assert_eq!(sent.history[1].content, "First.");
    }

    #[tokio::test]
    async fn repeated_message_keeps_earlier_copy_in_history() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("Again.", 5, None)));
        let (runner, history) = runner(client.clone(), None, TurnConfig::new("sys"));
        history
            .seed(KEY, vec![Turn::assistant("Hello."), Turn::user("ping")])
            .await;

        runner.run_turn(KEY, "ping").await.unwrap();

        let requests = client.requests();
        let sent = &requests[0];
        assert_eq!(sent.history.len(), 2);
        assert_eq!(sent.history[1].role, TurnRole::User);
        assert_eq!(sent.history[1].content, "ping");
        assert_eq!(sent.user_message, "ping");
        assert_eq!(history.fetch(KEY).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn generation_failure_becomes_apology() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Err("HTTP 500: boom".to_string()));
        let (runner, history) = runner(client, None, TurnConfig::new("sys"));

        let report = runner.run_turn(KEY, "hello").await.unwrap();

        assert_eq!(report.answer, GENERATION_FAILED_ANSWER);
        assert_eq!(report.kind, AnswerKind::Text);
        assert_eq!(report.token_trace.turn_total_tokens, 0);
        assert!(report.usage_trace.is_none());
        assert_eq!(history.fetch(KEY).await.unwrap()[1].content, GENERATION_FAILED_ANSWER);
    }

    #[tokio::test]
    async fn over_budget_turn_compacts_and_reports() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("Sure.", 120, None)));
        client.push_text("Summary.", Some(20), None);
        let config = TurnConfig::new("sys")
            .with_prompt_cache(false)
            .with_notify_compaction_updates(true);
        let (runner, history) = runner(client.clone(), Some(100), config);

        let report = runner.run_turn(KEY, "plan my week").await.unwrap();

        assert_eq!(report.compaction_updates, vec![UPDATE_RUNNING, UPDATE_DONE, "Summary."]);
        assert_eq!(report.token_trace.turn_total_tokens, 140);
        assert_eq!(report.token_trace.session_total_tokens_before_compaction, Some(120));
        assert_eq!(report.token_trace.session_total_tokens, 0);
        assert!(report.token_trace.compaction_performed);
        assert_eq!(runner.ledger().current_tokens(KEY), 0);

        let turns = history.fetch(KEY).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, COMPACTION_REQUEST);

        let requests = client.requests();
        let compact_request = &requests[1];
        assert_eq!(
            compact_request.prompt_cache_key.as_deref(),
            Some("telegram:7:runtime:compact")
        );
        assert_eq!(compact_request.history.len(), 2);
    }

    #[tokio::test]
    async fn history_limit_applies_after_each_append() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("ok", 1, None)));
        let (runner, history) =
            runner(client.clone(), None, TurnConfig::new("sys").with_max_history_messages(2));
        history
            .seed(KEY, vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")])
            .await;

        runner.run_turn(KEY, "d").await.unwrap();

        assert_eq!(client.requests()[0].history.len(), 1);
        let turns = history.fetch(KEY).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "d");
        assert_eq!(turns[1].content, "ok");
    }

    #[tokio::test]
    async fn handle_mode_chains_response_ids() {
        let client = Arc::new(ScriptedClient::stateful());
        client.push_generation(Ok(structured("one", 1, Some("resp-1"))));
        client.push_generation(Ok(structured("two", 1, Some("resp-2"))));
        let config = TurnConfig::new("sys").with_state_mode(StateMode::PreviousResponseId);
        let (runner, _) = runner(client.clone(), None, config);

        runner.run_turn(KEY, "first").await.unwrap();
        runner.run_turn(KEY, "second").await.unwrap();

        let requests = client.requests();
        assert_eq!(requests[0].previous_response_id, None);
        assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp-1"));
        assert_eq!(runner.ledger().previous_response_id(KEY).as_deref(), Some("resp-2"));
    }

    #[tokio::test]
    async fn full_messages_mode_clears_handle() {
        let client = Arc::new(ScriptedClient::stateful());
        client.push_generation(Ok(structured("one", 1, Some("resp-1"))));
        let (runner, _) = runner(client.clone(), None, TurnConfig::new("sys"));
        runner.ledger().set_previous_response_id(KEY, "stale");

        runner.run_turn(KEY, "first").await.unwrap();

        assert_eq!(client.requests()[0].previous_response_id, None);
        assert!(!runner.ledger().has_previous_response_id(KEY));
    }

    #[tokio::test]
    async fn channel_context_is_forwarded() {
        let client = Arc::new(ScriptedClient::stateless());
        client.push_generation(Ok(structured("ok", 1, None)));
        let (runner, _) = runner(
            client.clone(),
            None,
            TurnConfig::new("sys").with_structured_output(false),
        );

        runner
            .run_turn_with(
                KEY,
                "hi",
                TurnInput {
                    channel: Some("telegram"),
                    owner_id: Some("owner-1"),
                },
            )
            .await
            .unwrap();

        let requests = client.requests();
        let sent = &requests[0];
        assert!(sent.has_tool_context);
        assert!(!sent.has_response_schema);
    }

    #[test]
    fn report_serializes_without_empty_fields() {
        let report = TurnReport {
            answer: "hi".into(),
            kind: AnswerKind::Text,
            should_reply: true,
            compaction_updates: Vec::new(),
            token_trace: SessionLedger::build_token_trace(3, None, 3, false),
            usage_trace: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("compaction_updates").is_none());
        assert!(json.get("usage_trace").is_none());
        assert_eq!(json["token_trace"]["accounting_scope"], "all_turn_calls");
    }
}
