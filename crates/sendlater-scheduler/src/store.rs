//! Whole-map JSON persistence — the single keyed blob of scheduling
//! state. Read wholesale at startup, written wholesale on every
//! mutation; only the core actor ever writes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sendlater_core::error::{Result, SendLaterError};
use sendlater_core::types::ScheduledMessage;

/// File-backed message store.
pub struct MessageStore {
    path: PathBuf,
}

impl MessageStore {
    /// Store rooted at the given data directory.
    pub fn new(dir: &Path) -> Self {
        std::fs::create_dir_all(dir).ok();
        Self {
            path: dir.to_path_buf(),
        }
    }

    /// Default data directory (~/.sendlater).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sendlater")
    }

    fn file(&self) -> PathBuf {
        self.path.join("messages.json")
    }

    /// Write the full record map to disk.
    pub fn save(&self, messages: &HashMap<String, ScheduledMessage>) -> Result<()> {
        let file = self.file();
        let json = serde_json::to_string_pretty(messages)
            .map_err(|e| SendLaterError::Storage(format!("serialize: {e}")))?;
        std::fs::write(&file, &json)
            .map_err(|e| SendLaterError::Storage(format!("write {}: {e}", file.display())))?;
        tracing::debug!("💾 Saved {} messages to {}", messages.len(), file.display());
        Ok(())
    }

    /// Load the record map. Missing or unreadable state comes back as an
    /// empty map with a warning; a corrupt blob never takes the core down.
    pub fn load(&self) -> HashMap<String, ScheduledMessage> {
        let file = self.file();
        if !file.exists() {
            return HashMap::new();
        }
        match std::fs::read_to_string(&file) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse {}: {e}", file.display());
                HashMap::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}", file.display());
                HashMap::new()
            }
        }
    }
}
