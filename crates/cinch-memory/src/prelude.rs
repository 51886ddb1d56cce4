//! Convenience re-exports for common `cinch-memory` types.
//!
//! ```ignore
//! use cinch_memory::prelude::*;
//! ```
//!
//! Covers wiring a compactor and a turn runner. Strategy outcomes, retry
//! tuning, and usage parsing stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ToolDef, Turn, TurnRole, json_schema_for};

// ── Ledger and locking ──────────────────────────────────────────────
pub use crate::ledger::{SessionLedger, TokenTrace, UsageReport, UsageSnapshot};
pub use crate::locks::{SessionGuard, SessionLocks};

// ── Compaction ──────────────────────────────────────────────────────
pub use crate::compaction::{
    CompactionConfig, CompactionOutcome, CompactionRequest, HistoryCompactor, StateMode,
};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::answer::{AnswerExtractor, RenderedAnswer, StructuredAnswerExtractor};
pub use crate::api::{ChatCompletionsClient, ResponsesClient};
pub use crate::client::{ClientCapabilities, Generation, GenerationClient, GenerationRequest};
pub use crate::history::{FileHistoryStore, HistoryStore, InMemoryHistory};
pub use crate::prompt::{DefaultPromptComposer, PromptComposer};

// ── Turns and configuration ─────────────────────────────────────────
pub use crate::config::{MemoryConfig, ProviderKind};
pub use crate::turn::{TurnConfig, TurnInput, TurnReport, TurnRunner};
