//! Test harness for master and node integration tests.
//!
//! Provides a fast-ticking cluster, scripted fake nodes that talk to the
//! master over the bus, and polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use jobmesh::bus::{MessageBus, Subscription};
use jobmesh::cluster::LocalCluster;
use jobmesh::config::{BusConfig, ClusterConfig, MasterConfig};
use jobmesh::master::{JobState, Master};
use jobmesh::protocol::{Endpoint, JobId, Message, MessageType, NodeId, Payload, Role};

/// Master settings with shorter intervals for faster tests
pub fn test_master_config() -> MasterConfig {
    MasterConfig {
        sweep_interval_ms: 20,
        capacity_timeout_ms: 300,
        ..MasterConfig::default()
    }
}

/// Bus settings that give up on a full inbox quickly
pub fn test_bus_config() -> BusConfig {
    BusConfig {
        send_timeout_ms: 200,
        ..BusConfig::default()
    }
}

pub fn test_cluster_config(fetchers: usize, workers: usize, collectors: usize) -> ClusterConfig {
    ClusterConfig {
        bus: test_bus_config(),
        ..ClusterConfig::new(fetchers, workers, collectors).with_master(test_master_config())
    }
}

/// Start a cluster with built-in role work and wait until every node has
/// registered.
pub async fn start_cluster(fetchers: usize, workers: usize, collectors: usize) -> LocalCluster {
    let cluster = LocalCluster::start(
        test_cluster_config(fetchers, workers, collectors),
        CancellationToken::new(),
    )
    .await;
    assert!(
        cluster.wait_registered(Duration::from_secs(5)).await,
        "nodes should register within 5 seconds"
    );
    cluster
}

/// A master running on its own bus, driven by fake nodes.
pub struct TestMaster {
    pub bus: MessageBus,
    pub master: Master,
    shutdown: CancellationToken,
}

impl TestMaster {
    pub async fn start() -> Self {
        Self::start_with(test_master_config()).await
    }

    pub async fn start_with(config: MasterConfig) -> Self {
        let bus = MessageBus::new(test_bus_config());
        let master = Master::new(config, bus.clone());
        let shutdown = CancellationToken::new();
        master.clone().spawn(shutdown.clone()).await;
        Self {
            bus,
            master,
            shutdown,
        }
    }

    /// Connect and announce a fake node, waiting until the master knows it.
    pub async fn node(&self, node_id: NodeId, role: Role) -> FakeNode {
        let node = FakeNode::connect(&self.bus, node_id).await;
        node.announce(role).await;
        let master = self.master.clone();
        assert_eventually(
            || {
                let master = master.clone();
                async move { master.nodes().await.iter().any(|n| n.id == node_id) }
            },
            Duration::from_secs(2),
            "fake node should register",
        )
        .await;
        node
    }
}

impl Drop for TestMaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A scripted node: sends what the test tells it to and exposes its inbox.
pub struct FakeNode {
    pub node_id: NodeId,
    bus: MessageBus,
    inbox: Subscription,
}

impl FakeNode {
    pub async fn connect(bus: &MessageBus, node_id: NodeId) -> Self {
        let inbox = bus.subscribe(Endpoint::Node(node_id)).await;
        Self {
            node_id,
            bus: bus.clone(),
            inbox,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Node(self.node_id)
    }

    pub async fn announce(&self, role: Role) {
        self.bus
            .send(
                Endpoint::Master,
                Message::new(self.endpoint(), role.announcement()),
            )
            .await
            .unwrap();
    }

    pub async fn send(&self, job_id: JobId, payload: Payload) {
        self.bus
            .send(
                Endpoint::Master,
                Message::for_job(self.endpoint(), job_id, payload),
            )
            .await
            .unwrap();
    }

    /// Next message, if one arrives within `timeout`
    pub async fn recv(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.inbox.next())
            .await
            .ok()
            .flatten()
    }

    /// Next message, which must be of `kind`
    pub async fn expect(&mut self, kind: MessageType) -> Message {
        let msg = self
            .recv(Duration::from_secs(2))
            .await
            .unwrap_or_else(|| {
                panic!("node {} expected {} but got nothing", self.node_id, kind)
            });
        assert_eq!(
            msg.kind(),
            kind,
            "node {} got unexpected message {:?}",
            self.node_id,
            msg
        );
        msg
    }

    /// Assert nothing arrives for a short while
    pub async fn expect_silence(&mut self) {
        if let Some(msg) = self.recv(Duration::from_millis(150)).await {
            panic!("node {} expected no message, got {:?}", self.node_id, msg);
        }
    }
}

/// Wait until `job_id` reaches `state`
pub async fn wait_for_state(master: &Master, job_id: JobId, state: JobState) -> bool {
    wait_for(
        || async move {
            master
                .job(job_id)
                .await
                .map(|job| job.state == state)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
