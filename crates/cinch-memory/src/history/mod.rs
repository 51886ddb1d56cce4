//! Turn history storage.
//!
//! The compactor only needs three operations from a store: fetch the whole
//! history, trim it to the latest N turns, and append one turn. Two stores
//! ship with the crate:
//!
//! - [`InMemoryHistory`]: process-local, for tests and short-lived bots.
//! - [`FileHistoryStore`]: one JSON document per session on disk.

mod file;

pub use file::FileHistoryStore;

use crate::{Turn, TurnRole};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Boxed future returned by [`HistoryStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Ordered, append-only per-session turn storage.
pub trait HistoryStore: Send + Sync {
    /// All turns for the session, oldest first. Unknown sessions are empty.
    fn fetch<'a>(&'a self, session_key: &'a str) -> StoreFuture<'a, Vec<Turn>>;

    /// Keep only the latest `keep_latest` turns; `0` removes everything.
    /// Returns the number of turns removed.
    fn trim<'a>(&'a self, session_key: &'a str, keep_latest: usize) -> StoreFuture<'a, usize>;

    /// Append one turn stamped with the current time.
    fn append<'a>(
        &'a self,
        session_key: &'a str,
        role: TurnRole,
        content: &'a str,
    ) -> StoreFuture<'a, ()>;
}

/// Drop all but the latest `keep_latest` turns in place.
pub(crate) fn trim_turns(turns: &mut Vec<Turn>, keep_latest: usize) -> usize {
    let removed = turns.len().saturating_sub(keep_latest);
    turns.drain(..removed);
    removed
}

// ── InMemoryHistory ────────────────────────────────────────────────

/// History held in a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session with existing turns, replacing whatever was there.
    pub async fn seed(&self, session_key: &str, turns: Vec<Turn>) {
        self.sessions
            .write()
            .await
            .insert(session_key.to_string(), turns);
    }
}

impl HistoryStore for InMemoryHistory {
    fn fetch<'a>(&'a self, session_key: &'a str) -> StoreFuture<'a, Vec<Turn>> {
        Box::pin(async move {
            Ok(self
                .sessions
                .read()
                .await
                .get(session_key)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn trim<'a>(&'a self, session_key: &'a str, keep_latest: usize) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            Ok(sessions
                .get_mut(session_key)
                .map_or(0, |turns| trim_turns(turns, keep_latest)))
        })
    }

    fn append<'a>(
        &'a self,
        session_key: &'a str,
        role: TurnRole,
        content: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.sessions
                .write()
                .await
                .entry(session_key.to_string())
                .or_default()
                .push(Turn::new(role, content));
            Ok(())
        })
    }
}
