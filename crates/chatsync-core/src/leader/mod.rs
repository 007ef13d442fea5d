//! Leader election and RPC among cooperating contexts ("tabs")
//!
//! Several tabs of the same worker group share one leader. The leader owns
//! the expensive resources (typically the [`WebSocketTransport`]) and serves
//! RPC calls from every tab, itself included.
//!
//! ```text
//!   tab A ─┐  tab-here (every 50ms until connected)
//!   tab B ─┼───────────────> election channel ──> leader
//!   tab C ─┘                                        │
//!                 connected / rpc-return / rpc-error │
//!   tab X <────────────── tab:X channel <───────────┘
//! ```
//!
//! Election is a named lease: every candidate waits on the same lease and
//! the holder is the leader. When the leader's context dies its lease drops,
//! the next waiter wins and posts `leader-here`, and every tab re-announces.
//! Calls in flight at that moment fail with
//! [`SyncError::LeaderChanged`](crate::SyncError::LeaderChanged) so callers
//! can retry against the new leader.
//!
//! Tab liveness works the same way: each tab holds its own lease for its
//! whole life, and the leader learns of its death by acquiring that lease.
//!
//! [`WebSocketTransport`]: crate::transport::WebSocketTransport

mod election;
mod follower;
mod protocol;
mod rpc;

pub use election::{spawn_candidate, CandidateHandle};
pub use follower::TabClient;
pub use protocol::{ControlMessage, InitOptions};
pub use rpc::RpcRouter;

use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncResult;
use crate::hub::BroadcastHub;
use crate::lease::LockManager;

/// How often an unconnected tab repeats `tab-here`
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables for leader coordination
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Period between `tab-here` announcements while unconnected
    pub announce_interval: Duration,
    /// Prefix for every channel and lease name
    pub namespace: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            announce_interval: ANNOUNCE_INTERVAL,
            namespace: "chatsync".to_string(),
        }
    }
}

/// Shared coordination services: channels, leases and naming.
///
/// Every tab of a worker group must use clones of the same value.
#[derive(Clone, Default)]
pub struct Coordination {
    pub hub: Arc<BroadcastHub<ControlMessage>>,
    pub locks: Arc<LockManager>,
    pub config: CoordinatorConfig,
}

impl Coordination {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            hub: Arc::new(BroadcastHub::default()),
            locks: Arc::new(LockManager::new()),
            config,
        }
    }

    pub(crate) fn election_channel(&self, worker_id: &str) -> String {
        format!("{}:election:{}", self.config.namespace, worker_id)
    }

    pub(crate) fn leader_lease(&self, worker_id: &str) -> String {
        format!("{}:leader:{}", self.config.namespace, worker_id)
    }

    pub(crate) fn tab_channel(&self, worker_id: &str, tab_id: &str) -> String {
        format!("{}:tab:{}:{}", self.config.namespace, worker_id, tab_id)
    }

    pub(crate) fn tab_lease(&self, worker_id: &str, tab_id: &str) -> String {
        format!("{}:tab-lease:{}:{}", self.config.namespace, worker_id, tab_id)
    }
}

/// A tab's follower client plus its leadership candidate
pub struct TabContext {
    pub client: TabClient,
    pub candidate: CandidateHandle,
}

/// Join a worker group: start announcing and enter the election
pub async fn join(
    coordination: &Coordination,
    worker_id: &str,
    router: RpcRouter,
) -> SyncResult<TabContext> {
    let client = TabClient::start(coordination, worker_id).await;
    let candidate = spawn_candidate(coordination.clone(), worker_id, Arc::new(router)).await?;
    Ok(TabContext { client, candidate })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_namespaced() {
        let coordination = Coordination::new(CoordinatorConfig {
            namespace: "app".to_string(),
            ..Default::default()
        });
        assert_eq!(coordination.election_channel("w"), "app:election:w");
        assert_eq!(coordination.leader_lease("w"), "app:leader:w");
        assert_eq!(coordination.tab_channel("w", "t"), "app:tab:w:t");
        assert_ne!(
            coordination.tab_lease("w", "t"),
            coordination.tab_channel("w", "t")
        );
    }
}
