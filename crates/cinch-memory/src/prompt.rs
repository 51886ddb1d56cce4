//! System-prompt composition.
//!
//! Prompt fragments live in plain markdown files under a prompts directory:
//!
//! ```text
//! prompts/
//!   compact.md           appended to the system prompt for summary compaction
//!   policies/*.md        appended to every turn's system prompt (sorted)
//!   channels/<name>.md   appended for turns arriving on that channel
//! ```
//!
//! Every file is optional. Files are read once and cached for the lifetime
//! of the composer.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Instruction appended for summary compaction when no `compact.md` exists.
pub const DEFAULT_COMPACT_INSTRUCTION: &str = "You are compacting conversation memory. \
Return a concise but complete summary of the conversation so far, preserving user goals, \
constraints, and pending tasks. Do not include preamble.";

/// Builds the system prompts sent with generation calls.
pub trait PromptComposer: Send + Sync {
    /// System prompt for an ordinary turn.
    fn compose_system_prompt(&self, base: &str, _channel: Option<&str>) -> String {
        base.to_string()
    }

    /// System prompt for a summary-compaction call.
    fn compact_system_prompt(&self, base: &str) -> String;
}

/// File-backed composer. Without a prompts directory it only ever adds
/// [`DEFAULT_COMPACT_INSTRUCTION`].
#[derive(Debug, Default)]
pub struct DefaultPromptComposer {
    prompts_dir: Option<PathBuf>,
    compact: OnceLock<Option<String>>,
    policies: OnceLock<Vec<String>>,
    channels: Mutex<HashMap<String, Option<String>>>,
}

impl DefaultPromptComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompts_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn prompts_dir(&self) -> Option<&Path> {
        self.prompts_dir.as_deref()
    }

    fn compact_prompt(&self) -> Option<&str> {
        self.compact
            .get_or_init(|| {
                self.prompts_dir
                    .as_ref()
                    .and_then(|dir| read_optional(&dir.join("compact.md")))
            })
            .as_deref()
    }

    fn policy_prompts(&self) -> &[String] {
        self.policies.get_or_init(|| {
            let Some(dir) = &self.prompts_dir else {
                return Vec::new();
            };
            let Ok(entries) = fs::read_dir(dir.join("policies")) else {
                return Vec::new();
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
                .collect();
            paths.sort();
            paths.iter().filter_map(|p| read_optional(p)).collect()
        })
    }

    fn channel_prompt(&self, channel: &str) -> Option<String> {
        let name = channel.trim().to_lowercase();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        let dir = self.prompts_dir.as_ref()?;
        let mut cache = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(name)
            .or_insert_with_key(|name| read_optional(&dir.join("channels").join(format!("{name}.md"))))
            .clone()
    }
}

/// Trimmed file contents, or `None` if the file is missing, unreadable, or blank.
fn read_optional(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl PromptComposer for DefaultPromptComposer {
    fn compose_system_prompt(&self, base: &str, channel: Option<&str>) -> String {
        let mut fragments = vec![base.to_string()];
        fragments.extend(self.policy_prompts().iter().cloned());
        if let Some(prompt) = channel.and_then(|c| self.channel_prompt(c)) {
            fragments.push(prompt);
        }
        debug!(
            "Composed system prompt: {} fragment(s), channel={:?}",
            fragments.len(),
            channel
        );
        fragments.join("\n\n")
    }

    fn compact_system_prompt(&self, base: &str) -> String {
        let instruction = self.compact_prompt().unwrap_or(DEFAULT_COMPACT_INSTRUCTION);
        format!("{base}\n\n{instruction}")
    }
}
