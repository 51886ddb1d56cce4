//! Per-session token accounting.
//!
//! The [`SessionLedger`] is the single owner of every session's counters:
//! the cumulative token total that drives compaction, the provider's
//! previous response id, and the latest usage snapshot reported by the
//! generation backend. All operations are total: unknown sessions read as
//! zero / absent, and entries are created lazily on the first write.
//!
//! The ledger does no I/O. Callers that need persistence take a
//! [`snapshot()`](SessionLedger::snapshot) and
//! [`restore()`](SessionLedger::restore) it later.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Usage figures as reported by a provider for one generation call.
///
/// Values are signed because providers occasionally report nonsense; the
/// ledger ignores anything absent or negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub reasoning_output_tokens: Option<i64>,
}

/// The most recent accepted value of each usage field for a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cached_input_tokens: Option<u64>,
    pub reasoning_output_tokens: Option<u64>,
}

impl UsageSnapshot {
    /// Whether no field has ever been recorded.
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.total_tokens.is_none()
            && self.cached_input_tokens.is_none()
            && self.reasoning_output_tokens.is_none()
    }

    fn merge(&mut self, report: &UsageReport) {
        overwrite_if_valid(&mut self.input_tokens, report.input_tokens);
        overwrite_if_valid(&mut self.output_tokens, report.output_tokens);
        overwrite_if_valid(&mut self.total_tokens, report.total_tokens);
        overwrite_if_valid(&mut self.cached_input_tokens, report.cached_input_tokens);
        overwrite_if_valid(
            &mut self.reasoning_output_tokens,
            report.reasoning_output_tokens,
        );
    }
}

fn overwrite_if_valid(slot: &mut Option<u64>, incoming: Option<i64>) {
    if let Some(value) = incoming.and_then(|v| u64::try_from(v).ok()) {
        *slot = Some(value);
    }
}

/// Counters kept for one session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Cumulative tokens since the last reset.
    #[serde(default)]
    pub total_tokens: u64,
    /// Provider handle for stateful continuation. Never `Some("")`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Latest usage snapshot.
    #[serde(default)]
    pub usage: UsageSnapshot,
}

/// Serializable copy of every session's counters, keyed by session.
pub type LedgerSnapshot = BTreeMap<String, SessionCounters>;

// ── Token trace ────────────────────────────────────────────────────

/// Which generation calls a [`TokenTrace`] accounts for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountingScope {
    /// Every generation call made during the turn, compaction included.
    AllTurnCalls,
}

/// Observability record describing a turn's token accounting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenTrace {
    pub turn_total_tokens: u64,
    pub session_total_tokens: u64,
    pub session_total_tokens_before_compaction: Option<u64>,
    pub session_total_tokens_after_compaction: u64,
    pub compaction_performed: bool,
    pub accounting_scope: AccountingScope,
}

// ── SessionLedger ──────────────────────────────────────────────────

/// Thread-safe map of session key → [`SessionCounters`].
///
/// Every method takes the internal lock for a single short critical
/// section, so individual operations are atomic. Read-then-reset sequences
/// spanning several calls are not; serialize those per session with
/// [`SessionLocks`](crate::locks::SessionLocks).
#[derive(Debug, Default)]
pub struct SessionLedger {
    sessions: Mutex<HashMap<String, SessionCounters>>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionCounters>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_session<R>(&self, key: &str, f: impl FnOnce(&mut SessionCounters) -> R) -> R {
        let mut sessions = self.sessions();
        f(sessions.entry(key.to_string()).or_default())
    }

    /// Add `tokens` to the session's cumulative total.
    ///
    /// Absent, zero, and negative values are ignored and return 0.
    /// Otherwise returns the amount added.
    pub fn track_tokens(&self, key: &str, tokens: Option<i64>) -> u64 {
        let Some(tokens) = tokens.filter(|t| *t > 0).map(|t| t.unsigned_abs()) else {
            return 0;
        };
        self.with_session(key, |s| s.total_tokens = s.total_tokens.saturating_add(tokens));
        tokens
    }

    /// Cumulative total since the last reset; 0 for unseen sessions.
    pub fn current_tokens(&self, key: &str) -> u64 {
        self.sessions().get(key).map_or(0, |s| s.total_tokens)
    }

    /// Reset the session's cumulative total to zero.
    pub fn reset_tokens(&self, key: &str) {
        self.with_session(key, |s| s.total_tokens = 0);
    }

    /// Store the provider's response id. Empty ids are ignored.
    pub fn set_previous_response_id(&self, key: &str, response_id: &str) {
        if response_id.is_empty() {
            return;
        }
        self.with_session(key, |s| s.previous_response_id = Some(response_id.to_string()));
    }

    pub fn previous_response_id(&self, key: &str) -> Option<String> {
        self.sessions()
            .get(key)
            .and_then(|s| s.previous_response_id.clone())
    }

    pub fn clear_previous_response_id(&self, key: &str) {
        if let Some(session) = self.sessions().get_mut(key) {
            session.previous_response_id = None;
        }
    }

    pub fn has_previous_response_id(&self, key: &str) -> bool {
        self.sessions()
            .get(key)
            .is_some_and(|s| s.previous_response_id.is_some())
    }

    /// Merge a provider usage report into the session's snapshot. Each field
    /// is overwritten independently, and only by a present, non-negative value.
    pub fn track_usage(&self, key: &str, report: UsageReport) {
        self.with_session(key, |s| s.usage.merge(&report));
    }

    pub fn latest_usage_trace(&self, key: &str) -> UsageSnapshot {
        self.sessions()
            .get(key)
            .map(|s| s.usage)
            .unwrap_or_default()
    }

    /// Copy every session's counters.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.sessions()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace all counters with the contents of `snapshot`.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let mut sessions = self.sessions();
        sessions.clear();
        for (key, mut counters) in snapshot {
            if counters.previous_response_id.as_deref() == Some("") {
                counters.previous_response_id = None;
            }
            sessions.insert(key, counters);
        }
    }

    /// Build the token trace attached to a turn's response metadata.
    ///
    /// `turn_total_tokens` and `after_compaction` are clamped at zero;
    /// `before_compaction` is passed through unchanged.
    pub fn build_token_trace(
        turn_total_tokens: i64,
        before_compaction: Option<u64>,
        after_compaction: i64,
        compaction_performed: bool,
    ) -> TokenTrace {
        let after = clamp_non_negative(after_compaction);
        TokenTrace {
            turn_total_tokens: clamp_non_negative(turn_total_tokens),
            session_total_tokens: after,
            session_total_tokens_before_compaction: before_compaction,
            session_total_tokens_after_compaction: after,
            compaction_performed,
            accounting_scope: AccountingScope::AllTurnCalls,
        }
    }
}

fn clamp_non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
