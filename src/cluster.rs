use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::bus::MessageBus;
use crate::config::ClusterConfig;
use crate::master::{Master, NodeState};
use crate::protocol::{NodeId, Role};
use crate::runtime::{RoleWork, WorkerRoleRuntime};

/// A role node running inside a [`LocalCluster`].
#[derive(Debug)]
pub struct NodeHandle {
    pub node_id: NodeId,
    pub role: Role,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A master plus its role nodes, wired over one in-process bus.
///
/// Node ids are handed out from 1 in start order: fetchers first, then
/// workers, then collectors.
pub struct LocalCluster {
    pub bus: MessageBus,
    pub master: Master,
    shutdown: CancellationToken,
    master_handle: JoinHandle<()>,
    api_handle: Option<JoinHandle<()>>,
    nodes: Vec<NodeHandle>,
    next_node_id: NodeId,
}

impl LocalCluster {
    /// Start a cluster whose nodes use the built-in role work.
    pub async fn start(config: ClusterConfig, shutdown: CancellationToken) -> Self {
        Self::start_with(config, shutdown, RoleWork::builtin).await
    }

    /// Start a cluster, choosing each node's work with `work_for`.
    ///
    /// This runs:
    /// 1. The master event loop
    /// 2. One runtime per configured fetcher, worker and collector
    /// 3. The HTTP API, if an address is configured
    pub async fn start_with(
        config: ClusterConfig,
        shutdown: CancellationToken,
        work_for: impl Fn(Role) -> RoleWork,
    ) -> Self {
        let bus = MessageBus::new(config.bus.clone());
        let master = Master::new(config.master.clone(), bus.clone());
        let master_handle = master.clone().spawn(shutdown.child_token()).await;

        let api_handle = config.api_addr.map(|addr| {
            let state = ApiState {
                master: master.clone(),
            };
            tokio::spawn(run_api(addr, state, shutdown.child_token()))
        });

        let mut cluster = Self {
            bus,
            master,
            shutdown,
            master_handle,
            api_handle,
            nodes: Vec::new(),
            next_node_id: 1,
        };

        for role in Role::ALL {
            let count = match role {
                Role::Fetcher => config.fetchers,
                Role::Worker => config.workers,
                Role::Collector => config.collectors,
            };
            for _ in 0..count {
                cluster.add_node(work_for(role)).await;
            }
        }

        tracing::info!(
            fetchers = config.fetchers,
            workers = config.workers,
            collectors = config.collectors,
            api = ?config.api_addr,
            "Local cluster started"
        );
        cluster
    }

    /// Start one more node with `work` and return its id.
    pub async fn add_node(&mut self, work: RoleWork) -> NodeId {
        let node_id = self.next_node_id;
        self.next_node_id += 1;

        let role = work.role();
        let token = self.shutdown.child_token();
        let runtime = WorkerRoleRuntime::new(node_id, work, self.bus.clone());
        let handle = runtime.spawn(token.clone()).await;

        self.nodes.push(NodeHandle {
            node_id,
            role,
            token,
            handle,
        });
        node_id
    }

    /// Ids of the running nodes of `role`, in start order.
    pub fn node_ids(&self, role: Role) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.node_id)
            .collect()
    }

    /// Shut a node down cleanly. Its runtime disconnects from the bus, so the
    /// master sees the departure right away.
    pub async fn stop_node(&mut self, node_id: NodeId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.node_id == node_id) else {
            return false;
        };
        let node = self.nodes.remove(pos);
        node.token.cancel();
        if let Err(e) = node.handle.await {
            tracing::warn!(node_id, error = %e, "Node task ended abnormally");
        }
        true
    }

    /// Kill a node without letting it disconnect. The master only notices
    /// once a send to it fails.
    pub fn crash_node(&mut self, node_id: NodeId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.node_id == node_id) else {
            return false;
        };
        let node = self.nodes.remove(pos);
        node.handle.abort();
        tracing::info!(node_id, role = %node.role, "Node crashed");
        true
    }

    /// Wait until every running node is registered with the master.
    pub async fn wait_registered(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let registered = self
                .master
                .nodes()
                .await
                .iter()
                .filter(|n| n.state != NodeState::Gone)
                .count();
            if registered >= self.nodes.len() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for node in self.nodes {
            let _ = node.handle.await;
        }
        let _ = self.master_handle.await;
        if let Some(api) = self.api_handle {
            let _ = api.await;
        }
        tracing::info!("Local cluster stopped");
    }
}
