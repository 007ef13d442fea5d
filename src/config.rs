//! Configuration for the server and client subcommands
//!
//! Both halves live in one optional JSON file:
//!
//! ```json
//! {
//!   "server": { "bind": "0.0.0.0:8787", "historyLimit": 50000 },
//!   "client": { "url": "ws://chat.local:8787/sync", "conversationId": "team" }
//! }
//! ```
//!
//! Missing fields fall back to their defaults; command-line flags override
//! whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chatsync_core::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Settings for `chatsync serve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind: String,
    /// HTTP path of the WebSocket endpoint
    pub path: String,
    /// Events kept for replay to reconnecting clients
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            path: "/sync".to_string(),
            history_limit: 10_000,
        }
    }
}

/// Settings for `chatsync connect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Server WebSocket URL
    pub url: String,
    /// Conversation that typed lines are appended to
    pub conversation_id: String,
    /// Where the offline queue is stored (default: ~/.chatsync)
    pub data_dir: Option<PathBuf>,
    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    pub reconnect_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/sync".to_string(),
            conversation_id: "lobby".to_string(),
            data_dir: None,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            ..Default::default()
        }
    }

    /// File holding events that could not be sent yet
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
            .join("pending.json")
    }

    /// File holding the resume position between runs
    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
            .join("cursor.json")
    }
}

/// Contents of a `--config` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Load the config file, or defaults when no path is given
pub fn load(path: Option<&Path>) -> Result<ConfigFile> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

/// Get the default data directory (~/.chatsync)
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatsync")
}
