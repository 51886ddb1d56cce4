//! JSON-file history store.
//!
//! Layout:
//! ```text
//! root/
//!   telegram%3A42.json
//!   .telegram%3A42.json.tmp   (only during a write)
//! ```

use super::{HistoryStore, StoreFuture, trim_turns};
use crate::locks::SessionLocks;
use crate::{Turn, TurnRole};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk document for one session.
#[derive(Serialize, Deserialize, Debug, Default)]
struct HistoryFile {
    session_key: String,
    #[serde(default)]
    turns: Vec<Turn>,
}

/// One pretty-printed JSON file per session, rewritten atomically.
pub struct FileHistoryStore {
    root: PathBuf,
    // One read-modify-write cycle per session at a time.
    write_locks: SessionLocks,
}

impl FileHistoryStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, String> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create history dir {}: {e}", root.display()))?;
        Ok(Self {
            root,
            write_locks: SessionLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(session_key)))
    }

    async fn load(&self, session_key: &str) -> Result<Vec<Turn>, String> {
        let path = self.path_for(session_key);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("Failed to read history {}: {e}", path.display())),
        };
        let file: HistoryFile = serde_json::from_str(&json)
            .map_err(|e| format!("Failed to parse history {}: {e}", path.display()))?;
        Ok(file.turns)
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    async fn save(&self, session_key: &str, turns: Vec<Turn>) -> Result<(), String> {
        let final_path = self.path_for(session_key);
        let tmp_path = self
            .root
            .join(format!(".{}.json.tmp", encode_key(session_key)));

        let file = HistoryFile {
            session_key: session_key.to_string(),
            turns,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| format!("Failed to serialize history: {e}"))?;
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| format!("Failed to write temp history: {e}"))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| format!("Failed to rename history: {e}"))?;
        Ok(())
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so any session key maps
/// to a single safe file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

impl HistoryStore for FileHistoryStore {
    fn fetch<'a>(&'a self, session_key: &'a str) -> StoreFuture<'a, Vec<Turn>> {
        Box::pin(async move { self.load(session_key).await })
    }

    fn trim<'a>(&'a self, session_key: &'a str, keep_latest: usize) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let _lock = self.write_locks.acquire(session_key).await;
            let mut turns = self.load(session_key).await?;
            let removed = trim_turns(&mut turns, keep_latest);
            if removed > 0 {
                self.save(session_key, turns).await?;
            }
            Ok(removed)
        })
    }

    fn append<'a>(
        &'a self,
        session_key: &'a str,
        role: TurnRole,
        content: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _lock = self.write_locks.acquire(session_key).await;
            let mut turns = self.load(session_key).await?;
            turns.push(Turn::new(role, content));
            self.save(session_key, turns).await
        })
    }
}
