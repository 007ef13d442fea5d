//! Client resume position
//!
//! Remembers the last server sequence the client saw and the next free
//! message index per conversation, so a restarted client asks only for what
//! it missed instead of the whole relay history.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cursor {
    /// Highest `serverSeq` delivered to this client
    pub last_seen: Option<u64>,
    pub next_index: BTreeMap<String, u64>,
}

impl Cursor {
    /// Read the cursor at `path`; a missing file is a fresh start
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cursor {}", path.display()))?;
        let cursor = serde_json::from_str(&text)
            .with_context(|| format!("Corrupt cursor {}", path.display()))?;
        debug!(path = %path.display(), ?cursor, "Loaded cursor");
        Ok(cursor)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write cursor {}", path.display()))?;
        Ok(())
    }

    pub fn next_index(&self, conversation: &str) -> u64 {
        self.next_index.get(conversation).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cursor_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = Cursor::load(&dir.path().join("cursor.json")).unwrap();
        assert_eq!(cursor, Cursor::default());
        assert_eq!(cursor.next_index("lobby"), 0);
    }

    #[test]
    fn test_cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cursor.json");

        let mut cursor = Cursor {
            last_seen: Some(1_700_000_000_000_042),
            ..Default::default()
        };
        cursor.next_index.insert("lobby".to_string(), 7);
        cursor.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"lastSeen\""));

        let reloaded = Cursor::load(&path).unwrap();
        assert_eq!(reloaded.last_seen, Some(1_700_000_000_000_042));
        assert_eq!(reloaded.next_index("lobby"), 7);
    }

    #[test]
    fn test_corrupt_cursor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "[").unwrap();

        let err = Cursor::load(&path).err().unwrap();
        assert!(err.to_string().contains("Corrupt cursor"));
    }
}
