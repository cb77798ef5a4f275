use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::protocol::Payload;

pub type NodeId = u64;
pub type JobId = Uuid;

/// The three worker-class roles a node can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Fetcher,
    Worker,
    Collector,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Fetcher, Role::Worker, Role::Collector];

    /// The `*-created` announcement a node of this role sends on startup.
    pub fn announcement(self) -> Payload {
        match self {
            Role::Fetcher => Payload::FetcherCreated,
            Role::Worker => Payload::WorkerCreated,
            Role::Collector => Payload::CollectorCreated,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Fetcher => write!(f, "fetcher"),
            Role::Worker => write!(f, "worker"),
            Role::Collector => write!(f, "collector"),
        }
    }
}

impl FromStr for Role {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetcher" => Ok(Role::Fetcher),
            "worker" => Ok(Role::Worker),
            "collector" => Ok(Role::Collector),
            other => Err(MeshError::UnknownRole(other.to_string())),
        }
    }
}

/// Bus address of a participant. The master has a single well-known address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Master,
    Node(NodeId),
}

impl Endpoint {
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Endpoint::Master => None,
            Endpoint::Node(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Master => write!(f, "master"),
            Endpoint::Node(id) => write!(f, "node-{}", id),
        }
    }
}

/// What a job needs: how many nodes of each role, and an opaque payload
/// handed to every fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub fetchers: usize,
    pub workers: usize,
    pub collectors: usize,
    #[serde(default)]
    pub payload: Value,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            fetchers: 1,
            workers: 1,
            collectors: 1,
            payload: Value::Null,
        }
    }
}

impl JobSpec {
    pub fn new(fetchers: usize, workers: usize, collectors: usize) -> Self {
        Self {
            fetchers,
            workers,
            collectors,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for role in Role::ALL {
            if self.count(role) == 0 {
                return Err(MeshError::InvalidJobSpec(format!(
                    "at least one {} is required",
                    role
                )));
            }
        }
        // Every worker must be fed by at least one fetcher.
        if self.workers > self.fetchers {
            return Err(MeshError::InvalidJobSpec(format!(
                "{} workers cannot be fed by {} fetchers",
                self.workers, self.fetchers
            )));
        }
        Ok(())
    }

    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Fetcher => self.fetchers,
            Role::Worker => self.workers,
            Role::Collector => self.collectors,
        }
    }

    /// Worker slot that receives the content fetched by `fetch_slot`.
    pub fn worker_for_fetch(&self, fetch_slot: usize) -> usize {
        fetch_slot % self.workers.max(1)
    }

    /// Number of fetched inputs routed to `worker_slot`.
    pub fn expected_inputs(&self, worker_slot: usize) -> usize {
        (0..self.fetchers)
            .filter(|&f| self.worker_for_fetch(f) == worker_slot)
            .count()
    }

    pub fn total_nodes(&self) -> usize {
        self.fetchers + self.workers + self.collectors
    }
}

/// Fetch work handed to one fetcher slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchDirective {
    pub index: usize,
    pub of: usize,
    pub payload: Value,
}

impl FetchDirective {
    /// The part of the payload addressed to this fetcher: the `index`-th
    /// element when the payload is an array, otherwise the whole payload.
    pub fn target(&self) -> &Value {
        match &self.payload {
            Value::Array(items) => items.get(self.index).unwrap_or(&Value::Null),
            other => other,
        }
    }
}

/// The position a node occupies in a job, sent with `new-job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub role: Role,
    pub slot: usize,
    /// Distinct inputs the node must see before it can report: fetched
    /// contents for a worker, worker results for a collector, zero for a
    /// fetcher.
    pub expected_inputs: usize,
}

/// A worker result recorded for a job. Appended once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub slot: usize,
    pub produced_at: DateTime<Utc>,
    pub payload: Value,
}
