//! Raft consensus integration.
//!
//! The coordinator treats the `openraft` crate as a linearizable
//! replicated log with snapshots: the state machine hangs off the storage
//! layer's apply hook, proposals go through `client_write`, and leadership
//! changes surface on a watch channel driven by Raft metrics.
//!
//! openraft's traits use RPITIT (`#[add_async_trait]`), so the storage and
//! network implementations use plain `async fn`, not `#[async_trait]`.

pub mod network;
pub mod storage;

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use openraft::error::{ClientWriteError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Entry, TokioRuntime};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::coordinator::command::{ApplyOutcome, LogCommand};
use crate::coordinator::state::CoordinatorState;
use crate::error::{EngineError, Result};

// The macro generates the TypeConfig struct and all required trait impls.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = LogCommand,
        R            = ApplyOutcome,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

pub use crate::coordinator::state::SharedState;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A running Raft node plus the handles the rest of the coordinator needs.
#[derive(Clone)]
pub struct RaftHandle {
    pub raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    state: SharedState,
    peers: Arc<BTreeMap<NodeId, String>>,
    leadership_rx: watch::Receiver<bool>,
}

impl RaftHandle {
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// Address of the current leader, for `NotLeader` hints.
    pub fn leader_hint(&self) -> Option<String> {
        let leader = self.raft.metrics().borrow().current_leader?;
        self.peers.get(&leader).cloned()
    }

    pub fn current_term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Fires with `true`/`false` as this node gains or loses leadership.
    pub fn leadership_watch(&self) -> watch::Receiver<bool> {
        self.leadership_rx.clone()
    }

    /// Propose one command and wait for its committed apply outcome.
    ///
    /// A timeout means the entry's fate is unknown: it may still commit.
    /// Callers must reconcile against the state machine instead of
    /// assuming failure.
    pub async fn propose(&self, command: LogCommand) -> Result<ApplyOutcome> {
        let write = tokio::time::timeout(PROPOSE_TIMEOUT, self.raft.client_write(command)).await;
        match write {
            Err(_) => Err(EngineError::Unavailable("propose timed out".into())),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                Err(EngineError::NotLeader {
                    leader_hint: fwd.leader_node.map(|node| node.addr),
                })
            }
            Ok(Err(RaftError::APIError(other))) => {
                Err(EngineError::Unavailable(other.to_string()))
            }
            Ok(Err(RaftError::Fatal(fatal))) => Err(EngineError::Unavailable(fatal.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl crate::coordinator::scheduler::ProposeLog for RaftHandle {
    async fn propose(&self, command: LogCommand) -> Result<ApplyOutcome> {
        RaftHandle::propose(self, command).await
    }
}

/// Start this node's Raft instance and initialize the cluster membership
/// on the lowest-id peer.
pub async fn start(config: &ClusterConfig) -> Result<RaftHandle> {
    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "gristmill".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: config.election_timeout_min_ms,
            election_timeout_max: config.election_timeout_max_ms,
            ..Default::default()
        }
        .validate()
        .map_err(|err| EngineError::Config(format!("invalid raft config: {err}")))?,
    );

    let state: SharedState = Arc::new(RwLock::new(CoordinatorState::new(config.max_attempts)));
    let store = storage::LogStore::new(state.clone());
    let (log_store, state_machine) = Adaptor::new(store);

    let raft = Arc::new(
        openraft::Raft::new(
            config.node_id,
            raft_config,
            network::HttpNetworkFactory::new(),
            log_store,
            state_machine,
        )
        .await
        .map_err(|err| EngineError::Unavailable(format!("failed to start raft: {err}")))?,
    );

    let peers: BTreeMap<NodeId, String> = config
        .peers
        .iter()
        .map(|p| (p.id, p.addr.clone()))
        .collect();

    let min_id = peers.keys().copied().min().unwrap_or(config.node_id);
    if config.node_id == min_id {
        let members: BTreeMap<NodeId, BasicNode> = peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();
        if let Err(err) = raft.initialize(members).await {
            info!(error = %err, "raft already initialized, continuing");
        }
    }

    let (leadership_tx, leadership_rx) = watch::channel(false);
    spawn_metrics_watcher(raft.clone(), config.node_id, leadership_tx);

    info!(node_id = config.node_id, peers = peers.len(), "raft node started");

    Ok(RaftHandle {
        raft,
        node_id: config.node_id,
        state,
        peers: Arc::new(peers),
        leadership_rx,
    })
}

fn spawn_metrics_watcher(
    raft: Arc<RaftInstance>,
    node_id: NodeId,
    leadership_tx: watch::Sender<bool>,
) {
    let mut rx = raft.metrics();
    tokio::spawn(async move {
        let mut was_leader = false;
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let metrics = rx.borrow().clone();
            let is_leader = metrics.current_leader == Some(node_id);
            if is_leader != was_leader {
                was_leader = is_leader;
                info!(
                    node_id,
                    is_leader,
                    term = metrics.current_term,
                    leader = ?metrics.current_leader,
                    "leadership changed"
                );
                if leadership_tx.send(is_leader).is_err() {
                    warn!("leadership watch receiver dropped");
                    break;
                }
            }
        }
    });
}
