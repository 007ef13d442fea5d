//! Control messages exchanged during leader election and tab RPC

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options the spawning context hands to a fresh candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitOptions {
    /// Worker group the candidate competes in
    pub id: String,
}

/// Messages on the spawner link, the election channel and tab channels.
///
/// Serialized with a kebab-case `type` tag, e.g.
/// `{"type":"rpc-call","callId":"01J..","method":"generate","args":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Candidate -> spawner: started, waiting for init
    Here,
    /// Spawner -> candidate
    Init { options: InitOptions },
    /// Candidate -> spawner: init accepted
    Ready { id: String },
    /// Tab -> leader on the election channel
    TabHere { id: String },
    /// New leader -> everyone on the election channel
    LeaderHere { id: String },
    /// Candidate -> spawner: this candidate won
    LeaderNow,
    /// Leader -> tab on the tab channel: registration done
    Connected,
    /// Tab -> leader
    RpcCall {
        call_id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    /// Leader -> tab: successful result
    RpcReturn {
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    /// Leader -> tab: the method failed
    RpcError { call_id: String, error: String },
}
