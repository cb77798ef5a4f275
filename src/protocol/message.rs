use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::protocol::types::{
    Endpoint, FetchDirective, JobId, JobResult, JobSpec, Role, SlotAssignment,
};

/// The closed vocabulary of message tags, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CreateJob,
    CollectorCreated,
    FetcherCreated,
    WorkerCreated,
    NewJob,
    KillJob,
    Result,
    GetWorkerResults,
    WorkerResults,
    Fetch,
    PushResults,
    ReceiveFetch,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::CreateJob,
        MessageType::CollectorCreated,
        MessageType::FetcherCreated,
        MessageType::WorkerCreated,
        MessageType::NewJob,
        MessageType::KillJob,
        MessageType::Result,
        MessageType::GetWorkerResults,
        MessageType::WorkerResults,
        MessageType::Fetch,
        MessageType::PushResults,
        MessageType::ReceiveFetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CreateJob => "create-job",
            MessageType::CollectorCreated => "collector-created",
            MessageType::FetcherCreated => "fetcher-created",
            MessageType::WorkerCreated => "worker-created",
            MessageType::NewJob => "new-job",
            MessageType::KillJob => "kill-job",
            MessageType::Result => "result",
            MessageType::GetWorkerResults => "get-results",
            MessageType::WorkerResults => "worker-results",
            MessageType::Fetch => "fetch",
            MessageType::PushResults => "push-results",
            MessageType::ReceiveFetch => "receive-fetch",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MeshError::UnknownMessageType(s.to_string()))
    }
}

/// Typed body of every message. The serde tag doubles as the wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    CreateJob {
        spec: JobSpec,
    },
    CollectorCreated,
    FetcherCreated,
    WorkerCreated,
    NewJob {
        spec: JobSpec,
        assignment: SlotAssignment,
    },
    KillJob,
    Result {
        payload: Value,
    },
    #[serde(rename = "get-results")]
    GetWorkerResults,
    WorkerResults {
        results: Vec<JobResult>,
    },
    Fetch {
        directive: FetchDirective,
    },
    PushResults {
        slot: usize,
        payload: Value,
    },
    ReceiveFetch {
        slot: usize,
        content: Value,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::CreateJob { .. } => MessageType::CreateJob,
            Payload::CollectorCreated => MessageType::CollectorCreated,
            Payload::FetcherCreated => MessageType::FetcherCreated,
            Payload::WorkerCreated => MessageType::WorkerCreated,
            Payload::NewJob { .. } => MessageType::NewJob,
            Payload::KillJob => MessageType::KillJob,
            Payload::Result { .. } => MessageType::Result,
            Payload::GetWorkerResults => MessageType::GetWorkerResults,
            Payload::WorkerResults { .. } => MessageType::WorkerResults,
            Payload::Fetch { .. } => MessageType::Fetch,
            Payload::PushResults { .. } => MessageType::PushResults,
            Payload::ReceiveFetch { .. } => MessageType::ReceiveFetch,
        }
    }

    /// Role announced by a `*-created` message.
    pub fn announced_role(&self) -> Option<Role> {
        match self {
            Payload::FetcherCreated => Some(Role::Fetcher),
            Payload::WorkerCreated => Some(Role::Worker),
            Payload::CollectorCreated => Some(Role::Collector),
            _ => None,
        }
    }
}

/// An addressed protocol message: who sent it, which job it concerns, and
/// the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(sender: Endpoint, payload: Payload) -> Self {
        Self {
            sender,
            job_id: None,
            payload,
        }
    }

    pub fn for_job(sender: Endpoint, job_id: JobId, payload: Payload) -> Self {
        Self {
            sender,
            job_id: Some(job_id),
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire message. The tag is checked against the vocabulary
    /// before the body, so an unknown type is reported as such rather than
    /// as a generic codec failure.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MeshError::UnknownMessageType("<missing>".to_string()))?;
        tag.parse::<MessageType>()?;
        Ok(serde_json::from_value(value)?)
    }
}
