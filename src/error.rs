use thiserror::Error;

use crate::master::job::{JobEvent, JobState};
use crate::protocol::{Endpoint, JobId, NodeId, Role};

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is already registered")]
    DuplicateNodeId(NodeId),

    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    #[error("Invalid transition for job {job_id}: {event} from {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        event: JobEvent,
    },

    #[error("Recipient unreachable: {0}")]
    RecipientUnreachable(Endpoint),

    #[error("Insufficient capacity for job {job_id}: no ready {role} node")]
    InsufficientCapacity { job_id: JobId, role: Role },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job ledger at capacity ({0} jobs)")]
    LedgerFull(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
