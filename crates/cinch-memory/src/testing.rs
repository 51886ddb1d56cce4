//! Test doubles shared by the unit tests.

use crate::client::{
    ClientCapabilities, ClientFuture, Generation, GenerationClient, GenerationRequest,
    NativeCompaction,
};
use crate::history::{HistoryStore, InMemoryHistory, StoreFuture};
use crate::{Turn, TurnRole};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Owned copy of a [`GenerationRequest`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub history: Vec<Turn>,
    pub user_message: String,
    pub has_user_content: bool,
    pub tool_count: usize,
    pub has_tool_context: bool,
    pub has_response_schema: bool,
    pub prompt_cache_key: Option<String>,
    pub previous_response_id: Option<String>,
    pub system_prompt: Option<String>,
}

/// Generation client that replays queued results and records every call.
pub struct ScriptedClient {
    capabilities: ClientCapabilities,
    generations: Mutex<VecDeque<Result<Generation, String>>>,
    compactions: Mutex<VecDeque<Result<NativeCompaction, String>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    compact_calls: Mutex<Vec<(String, Option<String>)>>,
    pub generate_count: AtomicUsize,
    pub compact_count: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(capabilities: ClientCapabilities) -> Self {
        Self {
            capabilities,
            generations: Mutex::new(VecDeque::new()),
            compactions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            compact_calls: Mutex::new(Vec::new()),
            generate_count: AtomicUsize::new(0),
            compact_count: AtomicUsize::new(0),
        }
    }

    pub fn stateless() -> Self {
        Self::new(ClientCapabilities::stateless())
    }

    pub fn stateful() -> Self {
        Self::new(ClientCapabilities::stateful())
    }

    pub fn push_generation(&self, result: Result<Generation, String>) {
        self.generations.lock().unwrap().push_back(result);
    }

    /// Queue a successful text generation.
    pub fn push_text(&self, text: &str, total_tokens: Option<i64>, response_id: Option<&str>) {
        self.push_generation(Ok(Generation {
            payload: Value::String(text.to_string()),
            response_id: response_id.map(str::to_string),
            total_tokens,
            ..Default::default()
        }));
    }

    pub fn push_compaction(&self, result: Result<NativeCompaction, String>) {
        self.compactions.lock().unwrap().push_back(result);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn compact_calls(&self) -> Vec<(String, Option<String>)> {
        self.compact_calls.lock().unwrap().clone()
    }

    pub fn generates(&self) -> usize {
        self.generate_count.load(Ordering::SeqCst)
    }

    pub fn compacts(&self) -> usize {
        self.compact_count.load(Ordering::SeqCst)
    }
}

impl GenerationClient for ScriptedClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
    }

    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> ClientFuture<'a, Generation> {
        self.generate_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(RecordedRequest {
            history: request.history.to_vec(),
            user_message: request.user_message.to_string(),
            has_user_content: request.user_content.is_some(),
            tool_count: request.tools.len(),
            has_tool_context: request.tool_context.is_some(),
            has_response_schema: request.response_schema.is_some(),
            prompt_cache_key: request.prompt_cache_key.map(str::to_string),
            previous_response_id: request.previous_response_id.map(str::to_string),
            system_prompt: request.system_prompt.map(str::to_string),
        });
        let next = self
            .generations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("no scripted generation".to_string()));
        Box::pin(async move { next })
    }

    fn compact_response<'a>(
        &'a self,
        previous_response_id: &'a str,
        prompt_cache_key: Option<&'a str>,
    ) -> ClientFuture<'a, NativeCompaction> {
        self.compact_count.fetch_add(1, Ordering::SeqCst);
        self.compact_calls.lock().unwrap().push((
            previous_response_id.to_string(),
            prompt_cache_key.map(str::to_string),
        ));
        let next = self
            .compactions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("no scripted compaction".to_string()));
        Box::pin(async move { next })
    }
}

/// In-memory history whose operations can be made to fail.
#[derive(Default)]
pub struct FlakyHistory {
    pub inner: InMemoryHistory,
    pub fail_fetch: AtomicBool,
    pub fail_append: AtomicBool,
}

impl HistoryStore for FlakyHistory {
    fn fetch<'a>(&'a self, session_key: &'a str) -> StoreFuture<'a, Vec<Turn>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Box::pin(async { Err("history unavailable".to_string()) });
        }
        self.inner.fetch(session_key)
    }

    fn trim<'a>(&'a self, session_key: &'a str, keep_latest: usize) -> StoreFuture<'a, usize> {
        self.inner.trim(session_key, keep_latest)
    }

    fn append<'a>(
        &'a self,
        session_key: &'a str,
        role: TurnRole,
        content: &'a str,
    ) -> StoreFuture<'a, ()> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Box::pin(async { Err("disk full".to_string()) });
        }
        self.inner.append(session_key, role, content)
    }
}
