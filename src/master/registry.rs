use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{MeshError, Result};
use crate::protocol::{JobId, NodeId, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Registering,
    Ready,
    Busy,
    Gone,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Registering => write!(f, "registering"),
            NodeState::Ready => write!(f, "ready"),
            NodeState::Busy => write!(f, "busy"),
            NodeState::Gone => write!(f, "gone"),
        }
    }
}

/// A node as seen by the master
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub role: Role,
    pub state: NodeState,
    /// Job the node is busy on
    pub job: Option<JobId>,
    /// Jobs handed to this node so far
    pub assignments: u64,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId, role: Role) -> Self {
        Self {
            id,
            role,
            state: NodeState::Registering,
            job: None,
            assignments: 0,
            registered_at: Utc::now(),
        }
    }
}

/// Live fetcher, worker and collector nodes
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a node that announced itself.
    pub fn register(&mut self, node_id: NodeId, role: Role) -> Result<NodeState> {
        if self.nodes.contains_key(&node_id) {
            return Err(MeshError::DuplicateNodeId(node_id));
        }
        let mut node = Node::new(node_id, role);
        node.state = NodeState::Ready;
        self.nodes.insert(node_id, node);
        tracing::info!(node_id, role = %role, "Node registered");
        Ok(NodeState::Ready)
    }

    pub fn mark_busy(&mut self, node_id: NodeId, job_id: JobId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::UnknownNode(node_id))?;
        node.state = NodeState::Busy;
        node.job = Some(job_id);
        node.assignments += 1;
        Ok(())
    }

    pub fn mark_ready(&mut self, node_id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::UnknownNode(node_id))?;
        node.state = NodeState::Ready;
        node.job = None;
        Ok(())
    }

    /// Remove a node. Idempotent: a second call returns `None`.
    ///
    /// The returned record is marked `Gone` and still names the job the node
    /// was serving, so the caller can re-dispatch its share.
    pub fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        let mut node = self.nodes.remove(&node_id)?;
        node.state = NodeState::Gone;
        tracing::info!(node_id, role = %node.role, job_id = ?node.job, "Node removed");
        Some(node)
    }

    /// Ready nodes of `role`, least-assigned first.
    pub fn nodes_by_role(&self, role: Role) -> Vec<NodeId> {
        let mut ready: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.role == role && n.state == NodeState::Ready)
            .collect();
        ready.sort_by_key(|n| (n.assignments, n.id));
        ready.into_iter().map(|n| n.id).collect()
    }

    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// All nodes, ordered by id
    pub fn all(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// (ready, busy) counts for `role`
    pub fn counts(&self, role: Role) -> (usize, usize) {
        self.nodes
            .values()
            .filter(|n| n.role == role)
            .fold((0, 0), |(ready, busy), n| match n.state {
                NodeState::Ready => (ready + 1, busy),
                NodeState::Busy => (ready, busy + 1),
                _ => (ready, busy),
            })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
