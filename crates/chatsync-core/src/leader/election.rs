use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use super::protocol::{ControlMessage, InitOptions};
use super::rpc::RpcRouter;
use super::Coordination;
use crate::error::{SyncError, SyncResult};
use crate::hub::{ChannelEndpoint, ChannelReceiver};
use crate::types::new_id;

/// Spawner-side handle to a running candidate.
///
/// Dropping the handle aborts the candidate, which releases the leader lease
/// if it held it.
pub struct CandidateHandle {
    candidate_id: String,
    worker_id: String,
    events: mpsc::UnboundedReceiver<ControlMessage>,
    is_leader: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CandidateHandle {
    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Wait until this candidate wins the election
    pub async fn wait_leader(&mut self) -> SyncResult<()> {
        if self.is_leader() {
            return Ok(());
        }
        while let Some(message) = self.events.recv().await {
            if message == ControlMessage::LeaderNow {
                return Ok(());
            }
        }
        Err(SyncError::Closed(format!("candidate {}", self.candidate_id)))
    }

    /// Stop competing, or step down if leading
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for CandidateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a candidate for `worker_id` and complete the here/init/ready
/// handshake with it.
pub async fn spawn_candidate(
    coordination: Coordination,
    worker_id: &str,
    router: Arc<RpcRouter>,
) -> SyncResult<CandidateHandle> {
    let candidate_id = new_id();
    let (to_candidate, inbox) = mpsc::unbounded_channel();
    let (outbox, mut events) = mpsc::unbounded_channel();
    let is_leader = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run_candidate(
        coordination,
        router,
        candidate_id.clone(),
        inbox,
        outbox,
        is_leader.clone(),
    ));

    let closed = || SyncError::Closed(format!("candidate {}", candidate_id));
    match events.recv().await {
        Some(ControlMessage::Here) => {}
        Some(other) => {
            return Err(SyncError::ProtocolViolation(format!(
                "expected here, got {:?}",
                other
            )))
        }
        None => return Err(closed()),
    }
    to_candidate
        .send(ControlMessage::Init {
            options: InitOptions {
                id: worker_id.to_string(),
            },
        })
        .map_err(|_| closed())?;
    match events.recv().await {
        Some(ControlMessage::Ready { .. }) => {}
        Some(other) => {
            return Err(SyncError::ProtocolViolation(format!(
                "expected ready, got {:?}",
                other
            )))
        }
        None => return Err(closed()),
    }
    debug!(%candidate_id, worker_id, "Candidate ready");

    Ok(CandidateHandle {
        candidate_id,
        worker_id: worker_id.to_string(),
        events,
        is_leader,
        task,
    })
}

async fn run_candidate(
    coordination: Coordination,
    router: Arc<RpcRouter>,
    candidate_id: String,
    mut inbox: mpsc::UnboundedReceiver<ControlMessage>,
    outbox: mpsc::UnboundedSender<ControlMessage>,
    is_leader: Arc<AtomicBool>,
) {
    let _ = outbox.send(ControlMessage::Here);
    let worker_id = loop {
        match inbox.recv().await {
            Some(ControlMessage::Init { options }) => break options.id,
            Some(other) => debug!(?other, "Ignoring message before init"),
            None => return,
        }
    };
    let _ = outbox.send(ControlMessage::Ready {
        id: candidate_id.clone(),
    });

    let _lease = coordination
        .locks
        .request(&coordination.leader_lease(&worker_id))
        .await;
    is_leader.store(true, Ordering::SeqCst);
    info!(%candidate_id, %worker_id, "Elected leader");

    let election = coordination
        .hub
        .open(&coordination.election_channel(&worker_id));
    let mut election_rx = election.subscribe();
    election.post(ControlMessage::LeaderHere {
        id: candidate_id.clone(),
    });
    let _ = outbox.send(ControlMessage::LeaderNow);

    let tabs = TabRegistry {
        coordination: coordination.clone(),
        worker_id,
        router,
        tabs: Arc::new(Mutex::new(HashMap::new())),
    };
    while let Some(message) = election_rx.recv().await {
        if let ControlMessage::TabHere { id } = message {
            tabs.register(&id);
        }
    }
}

struct TabTasks {
    serve: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

/// Tabs served by this leader. Dropping it stops serving all of them.
struct TabRegistry {
    coordination: Coordination,
    worker_id: String,
    router: Arc<RpcRouter>,
    tabs: Arc<Mutex<HashMap<String, TabTasks>>>,
}

impl TabRegistry {
    fn register(&self, tab_id: &str) {
        let channel = self.coordination.tab_channel(&self.worker_id, tab_id);
        let endpoint = self.coordination.hub.open(&channel);

        let mut tabs = self.tabs.lock();
        if tabs.contains_key(tab_id) {
            // repeat announcement, the tab missed our reply
            endpoint.post(ControlMessage::Connected);
            return;
        }

        let receiver = endpoint.subscribe();
        let serve = tokio::spawn(serve_tab(
            endpoint.clone(),
            receiver,
            self.router.clone(),
            tab_id.to_string(),
        ));
        let liveness = tokio::spawn(watch_tab(
            self.coordination.clone(),
            self.coordination.tab_lease(&self.worker_id, tab_id),
            channel,
            tab_id.to_string(),
            Arc::downgrade(&self.tabs),
        ));
        tabs.insert(tab_id.to_string(), TabTasks { serve, liveness });
        drop(tabs);

        endpoint.post(ControlMessage::Connected);
        info!(tab_id, "Tab connected");
    }
}

impl Drop for TabRegistry {
    fn drop(&mut self) {
        for (_, tasks) in self.tabs.lock().drain() {
            tasks.serve.abort();
            tasks.liveness.abort();
        }
    }
}

async fn serve_tab(
    endpoint: ChannelEndpoint<ControlMessage>,
    mut receiver: ChannelReceiver<ControlMessage>,
    router: Arc<RpcRouter>,
    tab_id: String,
) {
    // dropped with this task, aborting calls still running
    let mut calls = JoinSet::new();
    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(ControlMessage::RpcCall { call_id, method, args }) => {
                    debug!(%tab_id, %call_id, %method, "RPC call");
                    let endpoint = endpoint.clone();
                    let router = router.clone();
                    calls.spawn(async move {
                        let reply = match router.dispatch(&method, args).await {
                            Ok(result) => ControlMessage::RpcReturn { call_id, result },
                            Err(error) => ControlMessage::RpcError { call_id, error },
                        };
                        endpoint.post(reply);
                    });
                }
                Some(_) => {}
                None => break,
            },
            Some(_) = calls.join_next(), if !calls.is_empty() => {}
        }
    }
}

async fn watch_tab(
    coordination: Coordination,
    lease: String,
    channel: String,
    tab_id: String,
    tabs: Weak<Mutex<HashMap<String, TabTasks>>>,
) {
    // granted only once the tab released it, i.e. died
    drop(coordination.locks.request(&lease).await);

    if let Some(tabs) = tabs.upgrade() {
        if let Some(tasks) = tabs.lock().remove(&tab_id) {
            tasks.serve.abort();
        }
    }
    coordination.hub.remove(&channel);
    coordination.locks.prune();
    info!(%tab_id, "Tab disconnected");
}
