use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::protocol::ControlMessage;
use super::Coordination;
use crate::error::{SyncError, SyncResult};
use crate::hub::{ChannelEndpoint, ChannelReceiver};
use crate::lease::Lease;
use crate::types::new_id;

type Reply = Result<Value, String>;

struct TabShared {
    tab_id: String,
    endpoint: ChannelEndpoint<ControlMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    /// Cancelled whenever a new leader appears
    epoch: Mutex<CancellationToken>,
    connected: watch::Sender<bool>,
    leader: watch::Sender<Option<String>>,
}

impl TabShared {
    fn complete(&self, call_id: &str, reply: Reply) {
        match self.pending.lock().remove(call_id) {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => debug!(tab_id = %self.tab_id, call_id, "Reply for unknown call"),
        }
    }

    fn leader_changed(&self, leader_id: String) {
        info!(tab_id = %self.tab_id, %leader_id, "Leader changed, re-announcing");
        // connected drops before the epoch so callers never pair a fresh
        // token with the old leader
        self.connected.send_replace(false);
        let previous = std::mem::replace(&mut *self.epoch.lock(), CancellationToken::new());
        previous.cancel();
        self.leader.send_replace(Some(leader_id));
    }
}

/// A tab's connection to whichever context currently leads its worker group.
///
/// The client holds the tab's liveness lease for its whole life; dropping it
/// tells the leader the tab is gone.
pub struct TabClient {
    shared: Arc<TabShared>,
    task: JoinHandle<()>,
    _lease: Lease,
}

impl TabClient {
    /// Start with a fresh tab id
    pub async fn start(coordination: &Coordination, worker_id: &str) -> Self {
        Self::start_with_id(coordination, worker_id, &new_id()).await
    }

    pub async fn start_with_id(coordination: &Coordination, worker_id: &str, tab_id: &str) -> Self {
        let lease = coordination
            .locks
            .request(&coordination.tab_lease(worker_id, tab_id))
            .await;

        let election = coordination
            .hub
            .open(&coordination.election_channel(worker_id));
        let endpoint = coordination
            .hub
            .open(&coordination.tab_channel(worker_id, tab_id));

        let shared = Arc::new(TabShared {
            tab_id: tab_id.to_string(),
            endpoint: endpoint.clone(),
            pending: Mutex::new(HashMap::new()),
            epoch: Mutex::new(CancellationToken::new()),
            connected: watch::channel(false).0,
            leader: watch::channel(None).0,
        });

        // subscribe before the first announcement goes out
        let election_rx = election.subscribe();
        let tab_rx = endpoint.subscribe();
        let task = tokio::spawn(run_tab(
            shared.clone(),
            election,
            election_rx,
            tab_rx,
            coordination.config.announce_interval,
        ));

        Self {
            shared,
            task,
            _lease: lease,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.tab_id
    }

    /// Whether the current leader acknowledged this tab
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub async fn wait_connected(&self) -> SyncResult<()> {
        let mut rx = self.shared.connected.subscribe();
        rx.wait_for(|connected| *connected)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed(format!("tab {}", self.id())))
    }

    /// Id of the most recently announced leader
    pub fn leader_changes(&self) -> watch::Receiver<Option<String>> {
        self.shared.leader.subscribe()
    }

    /// Invoke a method on the leader.
    ///
    /// Waits for a connected leader first. Fails with
    /// [`SyncError::LeaderChanged`] if leadership moves before the reply.
    pub async fn call(&self, method: &str, args: Value) -> SyncResult<Value> {
        let token = loop {
            self.wait_connected().await?;
            let token = self.shared.epoch.lock().clone();
            if self.is_connected() {
                break token;
            }
        };

        let call_id = new_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(call_id.clone(), tx);
        self.shared.endpoint.post(ControlMessage::RpcCall {
            call_id: call_id.clone(),
            method: method.to_string(),
            args,
        });

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(SyncError::Rpc(error)),
                Err(_) => Err(SyncError::Closed(format!("tab {}", self.id()))),
            },
            _ = token.cancelled() => {
                self.shared.pending.lock().remove(&call_id);
                Err(SyncError::LeaderChanged { call_id })
            }
        }
    }
}

impl Drop for TabClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_tab(
    shared: Arc<TabShared>,
    election: ChannelEndpoint<ControlMessage>,
    mut election_rx: ChannelReceiver<ControlMessage>,
    mut tab_rx: ChannelReceiver<ControlMessage>,
    announce_interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(announce_interval);
    loop {
        let connected = *shared.connected.borrow();
        tokio::select! {
            _ = ticker.tick(), if !connected => {
                election.post(ControlMessage::TabHere { id: shared.tab_id.clone() });
            }
            message = tab_rx.recv() => match message {
                Some(ControlMessage::Connected) => {
                    if !connected {
                        debug!(tab_id = %shared.tab_id, "Connected to leader");
                    }
                    shared.connected.send_replace(true);
                }
                Some(ControlMessage::RpcReturn { call_id, result }) => {
                    shared.complete(&call_id, Ok(result));
                }
                Some(ControlMessage::RpcError { call_id, error }) => {
                    shared.complete(&call_id, Err(error));
                }
                Some(_) => {}
                None => break,
            },
            message = election_rx.recv() => match message {
                Some(ControlMessage::LeaderHere { id }) => shared.leader_changed(id),
                Some(_) => {}
                None => break,
            },
        }
    }
}
