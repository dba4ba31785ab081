//! HTTP transport for Raft peer RPCs.
//!
//! openraft request and response types are JSON bodies on the same axum
//! surface that serves worker and client RPCs, so a replica group needs
//! exactly one listening port per node.

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::{NodeId, TypeConfig};

pub const APPEND_ENTRIES_PATH: &str = "/raft/append-entries";
pub const VOTE_PATH: &str = "/raft/vote";
pub const INSTALL_SNAPSHOT_PATH: &str = "/raft/install-snapshot";

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer HTTP channel.
pub struct HttpNetwork {
    target_addr: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    async fn send<Req, Resp, E>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, RPCError<NodeId, BasicNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error,
    {
        let url = format!("http://{}{}", self.target_addr, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        if !response.status().is_success() {
            return Err(RPCError::Unreachable(unreachable(format!(
                "peer returned {}",
                response.status()
            ))));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send(APPEND_ENTRIES_PATH, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send(VOTE_PATH, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send(INSTALL_SNAPSHOT_PATH, &rpc).await
    }
}

/// Creates `HttpNetwork` instances per target peer.
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> Self {
        // Short per-RPC timeouts keep heartbeats failing fast instead of
        // hanging until a follower's election timer fires.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(4))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpNetworkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        HttpNetwork {
            target_addr: node.addr.clone(),
            client: self.client.clone(),
        }
    }
}
