use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::protocol::{JobId, JobResult, JobSpec, NodeId, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Killed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Complete,
    Kill,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEvent::Start => write!(f, "start"),
            JobEvent::Complete => write!(f, "complete"),
            JobEvent::Kill => write!(f, "kill"),
        }
    }
}

/// One required role position of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub role: Role,
    pub index: usize,
    pub node: Option<NodeId>,
    pub reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The job already reached a terminal state
    Finished(JobState),
    /// The sender holds no open slot in the job
    NotAssigned,
    /// The sender's slot already reported
    Duplicate,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::Finished(state) => write!(f, "job {}", state),
            DiscardReason::NotAssigned => write!(f, "not assigned"),
            DiscardReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { role: Role, slot: usize },
    Discarded(DiscardReason),
}

/// Why a job is waiting on nodes, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub role: Role,
    pub since: DateTime<Utc>,
    /// Set once the stall has been reported as overdue
    pub reported: bool,
}

impl Stall {
    pub fn is_overdue(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now() - self.since;
        elapsed.to_std().map(|e| e >= timeout).unwrap_or(false)
    }
}

/// Lifecycle and bookkeeping for one job.
///
/// A job completes once every slot has reported: each fetcher its content,
/// each worker its result, each collector its aggregate.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    slots: Vec<Slot>,
    fetched: BTreeMap<usize, Value>,
    results: Vec<JobResult>,
    collected: Vec<JobResult>,
    stall: Option<Stall>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec)
    }

    pub fn with_id(id: JobId, spec: JobSpec) -> Self {
        let slots = Role::ALL
            .into_iter()
            .flat_map(|role| {
                (0..spec.count(role)).map(move |index| Slot {
                    role,
                    index,
                    node: None,
                    reported: false,
                })
            })
            .collect();

        Self {
            id,
            spec,
            state: JobState::Pending,
            created_at: Utc::now(),
            finished_at: None,
            slots,
            fetched: BTreeMap::new(),
            results: Vec::new(),
            collected: Vec::new(),
            stall: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Apply `event`. Terminal states absorb every event, so re-killing or
    /// re-completing a finished job returns its state unchanged.
    pub fn transition(&mut self, event: JobEvent) -> Result<JobState> {
        let next = match (self.state, event) {
            (state, _) if state.is_terminal() => return Ok(state),
            (JobState::Pending, JobEvent::Start) => JobState::Running,
            (JobState::Running, JobEvent::Complete) => JobState::Completed,
            (JobState::Pending | JobState::Running, JobEvent::Kill) => JobState::Killed,
            (from, event) => {
                return Err(MeshError::InvalidTransition {
                    job_id: self.id,
                    from,
                    event,
                })
            }
        };

        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.stall = None;
        }
        Ok(next)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Unreported slots with no node, in role order
    pub fn vacant_slots(&self) -> Vec<(Role, usize)> {
        self.slots
            .iter()
            .filter(|s| !s.reported && s.node.is_none())
            .map(|s| (s.role, s.index))
            .collect()
    }

    pub fn assign(&mut self, role: Role, index: usize, node_id: NodeId) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.role == role && s.index == index)
        {
            slot.node = Some(node_id);
        }
    }

    /// Free the open slot held by `node_id`. Returns the slot when there was
    /// unreported work to re-dispatch.
    pub fn vacate(&mut self, node_id: NodeId) -> Option<(Role, usize)> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.node == Some(node_id) && !s.reported)?;
        slot.node = None;
        Some((slot.role, slot.index))
    }

    /// Node holding slot `index` of `role`, while that slot has not reported
    pub fn open_node(&self, role: Role, index: usize) -> Option<NodeId> {
        self.slots
            .iter()
            .find(|s| s.role == role && s.index == index && !s.reported)
            .and_then(|s| s.node)
    }

    /// Role of the open slot held by `node_id`
    pub fn open_role(&self, node_id: NodeId) -> Option<Role> {
        self.slots
            .iter()
            .find(|s| s.node == Some(node_id) && !s.reported)
            .map(|s| s.role)
    }

    /// Nodes still working on this job
    pub fn busy_nodes(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .filter(|s| !s.reported)
            .filter_map(|s| s.node)
            .collect()
    }

    /// Every node that has held a slot
    pub fn assigned_nodes(&self) -> BTreeSet<NodeId> {
        self.slots.iter().filter_map(|s| s.node).collect()
    }

    /// Record a report from `node_id`. Fetchers report fetched content,
    /// workers their result, collectors the aggregate.
    pub fn record(&mut self, node_id: NodeId, payload: Value) -> RecordOutcome {
        match self.state {
            JobState::Running => {}
            JobState::Pending => return RecordOutcome::Discarded(DiscardReason::NotAssigned),
            state => return RecordOutcome::Discarded(DiscardReason::Finished(state)),
        }

        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.node == Some(node_id) && !s.reported)
        else {
            let reason = if self.slots.iter().any(|s| s.node == Some(node_id)) {
                DiscardReason::Duplicate
            } else {
                DiscardReason::NotAssigned
            };
            return RecordOutcome::Discarded(reason);
        };

        slot.reported = true;
        let (role, index) = (slot.role, slot.index);
        match role {
            Role::Fetcher => {
                self.fetched.insert(index, payload);
            }
            Role::Worker | Role::Collector => {
                let result = JobResult {
                    job_id: self.id,
                    node_id,
                    slot: index,
                    produced_at: Utc::now(),
                    payload,
                };
                if role == Role::Worker {
                    self.results.push(result);
                } else {
                    self.collected.push(result);
                }
            }
        }
        RecordOutcome::Recorded { role, slot: index }
    }

    pub fn all_reported(&self) -> bool {
        self.slots.iter().all(|s| s.reported)
    }

    /// Fetched content routed to `worker_slot`, by fetch slot
    pub fn fetched_for(&self, worker_slot: usize) -> Vec<(usize, Value)> {
        self.fetched
            .iter()
            .filter(|(&fetch_slot, _)| self.spec.worker_for_fetch(fetch_slot) == worker_slot)
            .map(|(&fetch_slot, content)| (fetch_slot, content.clone()))
            .collect()
    }

    /// Worker results, in the order they were recorded
    pub fn results(&self) -> &[JobResult] {
        &self.results
    }

    /// Collector aggregates, in the order they were recorded
    pub fn collected(&self) -> &[JobResult] {
        &self.collected
    }

    pub fn stall(&self) -> Option<Stall> {
        self.stall
    }

    /// Note that `role` has no ready node. The first stall time is kept.
    pub fn mark_stalled(&mut self, role: Role) {
        match &mut self.stall {
            Some(stall) => stall.role = role,
            None => {
                self.stall = Some(Stall {
                    role,
                    since: Utc::now(),
                    reported: false,
                })
            }
        }
    }

    /// Role of a stall that has lasted at least `timeout` and was not
    /// reported yet. Returns it only once per stall.
    pub fn take_overdue_stall(&mut self, timeout: Duration) -> Option<Role> {
        let stall = self.stall.as_mut()?;
        if stall.reported || !stall.is_overdue(timeout) {
            return None;
        }
        stall.reported = true;
        Some(stall.role)
    }

    pub fn clear_stall(&mut self) {
        self.stall = None;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state,
            spec: self.spec.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            slots: self.slots.clone(),
            results: self.results.len(),
            collected: self.collected.iter().map(|r| r.payload.clone()).collect(),
            stalled_on: self.stall.map(|s| s.role),
        }
    }
}

/// Read-only view of a job for callers outside the master
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub slots: Vec<Slot>,
    pub results: usize,
    pub collected: Vec<Value>,
    pub stalled_on: Option<Role>,
}

impl JobSnapshot {
    pub fn assigned_nodes(&self) -> BTreeSet<NodeId> {
        self.slots.iter().filter_map(|s| s.node).collect()
    }
}
