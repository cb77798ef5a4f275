use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Subscription};
use crate::error::{MeshError, Result};
use crate::protocol::{
    Endpoint, FetchDirective, JobId, JobResult, Message, NodeId, Payload, Role, SlotAssignment,
};
use crate::runtime::work::{error_payload, RoleWork};

/// The job a node is currently serving.
#[derive(Debug)]
struct Task {
    /// Distinguishes successive tasks, even for the same job
    seq: u64,
    job_id: JobId,
    assignment: SlotAssignment,
    token: CancellationToken,
    /// Fetched content (worker) or reported worker slots (collector), by slot
    inputs: BTreeMap<usize, Value>,
    /// Collector asked the master for worker results
    requested: bool,
    /// Work was handed off; nothing more to gather
    started: bool,
}

impl Task {
    fn new(seq: u64, job_id: JobId, assignment: SlotAssignment) -> Self {
        Self {
            seq,
            job_id,
            assignment,
            token: CancellationToken::new(),
            inputs: BTreeMap::new(),
            requested: false,
            started: false,
        }
    }

    fn has_all_inputs(&self) -> bool {
        self.inputs.len() >= self.assignment.expected_inputs
    }
}

/// Node loop shared by fetchers, workers and collectors.
///
/// Announces itself to the master once, then serves one job at a time.
/// Role-specific behavior is limited to which messages feed the work and
/// which message carries the report.
pub struct WorkerRoleRuntime {
    node_id: NodeId,
    work: RoleWork,
    bus: MessageBus,
    task: Option<Task>,
    next_seq: u64,
    /// Sequence numbers of tasks whose report went out
    reported_tx: mpsc::UnboundedSender<u64>,
    reported_rx: Option<mpsc::UnboundedReceiver<u64>>,
}

impl WorkerRoleRuntime {
    pub fn new(node_id: NodeId, work: RoleWork, bus: MessageBus) -> Self {
        let (reported_tx, reported_rx) = mpsc::unbounded_channel();
        Self {
            node_id,
            work,
            bus,
            task: None,
            next_seq: 0,
            reported_tx,
            reported_rx: Some(reported_rx),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> Role {
        self.work.role()
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Node(self.node_id)
    }

    /// Subscribe to this node's inbox and spawn the loop.
    pub async fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inbox = self.bus.subscribe(self.endpoint()).await;
        tokio::spawn(async move {
            if let Err(e) = self.run(inbox, shutdown).await {
                tracing::error!(error = %e, "Node runtime stopped");
            }
        })
    }

    pub async fn run(
        mut self,
        mut inbox: Subscription,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut reported = self
            .reported_rx
            .take()
            .ok_or_else(|| MeshError::Internal("node runtime already ran".to_string()))?;
        let role = self.role();
        self.bus
            .send(
                Endpoint::Master,
                Message::new(self.endpoint(), role.announcement()),
            )
            .await?;
        tracing::info!(node_id = self.node_id, role = %role, "Node announced");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.node_id, "Node shutting down");
                    break;
                }

                msg = inbox.next() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        tracing::info!(node_id = self.node_id, "Inbox closed");
                        break;
                    }
                },

                Some(seq) = reported.recv() => self.finish_task(seq),
            }
        }

        self.drop_task();
        self.bus.disconnect(self.endpoint()).await;
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message) {
        let kind = msg.kind();
        tracing::debug!(
            node_id = self.node_id,
            kind = %kind,
            job_id = ?msg.job_id,
            "Node received"
        );

        let Some(job_id) = msg.job_id else {
            tracing::warn!(
                node_id = self.node_id,
                kind = %kind,
                "Message without job id, ignoring"
            );
            return;
        };

        match (self.role(), msg.payload) {
            (_, Payload::NewJob { assignment, .. }) => self.start_task(job_id, assignment),
            (_, Payload::KillJob) => self.kill(job_id),
            (Role::Fetcher, Payload::Fetch { directive }) => self.on_fetch(job_id, directive),
            (Role::Worker, Payload::ReceiveFetch { slot, content }) => {
                self.on_fetched(job_id, slot, content)
            }
            (Role::Collector, Payload::PushResults { slot, payload }) => {
                self.on_worker_result(job_id, slot, payload).await
            }
            (Role::Collector, Payload::WorkerResults { results }) => {
                self.on_worker_results(job_id, results)
            }
            (role, _) => {
                tracing::warn!(
                    node_id = self.node_id,
                    role = %role,
                    kind = %kind,
                    "Unexpected message, ignoring"
                )
            }
        }
    }

    fn start_task(&mut self, job_id: JobId, assignment: SlotAssignment) {
        if assignment.role != self.role() {
            tracing::warn!(
                node_id = self.node_id,
                job_id = %job_id,
                assigned = %assignment.role,
                "Assignment for another role, ignoring"
            );
            return;
        }
        if let Some(previous) = self.task.as_ref() {
            tracing::debug!(
                node_id = self.node_id,
                previous = %previous.job_id,
                "Replacing current task"
            );
        }
        self.drop_task();
        tracing::info!(
            node_id = self.node_id,
            job_id = %job_id,
            slot = assignment.slot,
            "Assigned to job"
        );
        self.next_seq += 1;
        self.task = Some(Task::new(self.next_seq, job_id, assignment));
    }

    fn kill(&mut self, job_id: JobId) {
        if self.task.as_ref().is_some_and(|t| t.job_id == job_id) {
            tracing::info!(
                node_id = self.node_id,
                job_id = %job_id,
                "Job killed, dropping work"
            );
            self.drop_task();
        } else {
            tracing::debug!(
                node_id = self.node_id,
                job_id = %job_id,
                "Kill for job not held"
            );
        }
    }

    fn drop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.token.cancel();
        }
    }

    /// Discard the context of a task whose report went out. A newer task
    /// is left alone.
    fn finish_task(&mut self, seq: u64) {
        if self.task.as_ref().is_some_and(|t| t.seq == seq) {
            if let Some(task) = self.task.take() {
                tracing::debug!(
                    node_id = self.node_id,
                    job_id = %task.job_id,
                    "Task reported, context discarded"
                );
            }
        }
    }

    /// The current task, if it belongs to `job_id` and has not handed off
    /// its work yet.
    fn open_task(&mut self, job_id: JobId) -> Option<&mut Task> {
        match self.task.as_mut() {
            Some(task) if task.job_id == job_id && !task.started => Some(task),
            _ => {
                tracing::debug!(
                    node_id = self.node_id,
                    job_id = %job_id,
                    "No open task for job, ignoring"
                );
                None
            }
        }
    }

    fn on_fetch(&mut self, job_id: JobId, directive: FetchDirective) {
        let RoleWork::Fetcher(fetcher) = self.work.clone() else {
            return;
        };
        let Some(task) = self.open_task(job_id) else {
            return;
        };
        task.started = true;
        let seq = task.seq;
        let slot = directive.index;
        let token = task.token.clone();

        let work_token = token.clone();
        let work = async move {
            let content = fetcher.fetch(&directive, &work_token).await;
            (slot, content)
        };
        self.report(job_id, seq, token, work, |slot, content| {
            Payload::ReceiveFetch { slot, content }
        });
    }

    fn on_fetched(&mut self, job_id: JobId, slot: usize, content: Value) {
        let RoleWork::Worker(compute) = self.work.clone() else {
            return;
        };
        let Some(task) = self.open_task(job_id) else {
            return;
        };
        task.inputs.insert(slot, content);
        if !task.has_all_inputs() {
            return;
        }

        task.started = true;
        let seq = task.seq;
        let inputs: Vec<Value> = std::mem::take(&mut task.inputs).into_values().collect();
        let worker_slot = task.assignment.slot;
        let token = task.token.clone();

        let work_token = token.clone();
        let work = async move {
            let result = compute.compute(inputs, &work_token).await;
            (worker_slot, result)
        };
        self.report(job_id, seq, token, work, |slot, payload| {
            Payload::PushResults { slot, payload }
        });
    }

    async fn on_worker_result(&mut self, job_id: JobId, worker_slot: usize, payload: Value) {
        let node = self.endpoint();
        let Some(task) = self.open_task(job_id) else {
            return;
        };
        task.inputs.insert(worker_slot, payload);
        if task.requested || !task.has_all_inputs() {
            return;
        }

        task.requested = true;
        tracing::debug!(
            node_id = self.node_id,
            job_id = %job_id,
            "All worker results seen, requesting them"
        );
        let request = Message::for_job(node, job_id, Payload::GetWorkerResults);
        if let Err(e) = self.bus.send(Endpoint::Master, request).await {
            tracing::warn!(
                node_id = self.node_id,
                job_id = %job_id,
                error = %e,
                "Could not request worker results"
            );
        }
    }

    fn on_worker_results(&mut self, job_id: JobId, results: Vec<JobResult>) {
        let RoleWork::Collector(aggregate) = self.work.clone() else {
            return;
        };
        let Some(task) = self.open_task(job_id) else {
            return;
        };
        if !task.requested {
            tracing::debug!(
                node_id = self.node_id,
                job_id = %job_id,
                "Unrequested worker results, ignoring"
            );
            return;
        }

        task.started = true;
        let seq = task.seq;
        let collector_slot = task.assignment.slot;
        let token = task.token.clone();

        let work_token = token.clone();
        let work = async move {
            let aggregate = aggregate.aggregate(results, &work_token).await;
            (collector_slot, aggregate)
        };
        self.report(job_id, seq, token, work, |_, payload| Payload::Result { payload });
    }

    /// Run `work` on its own task and send its outcome to the master, unless
    /// the job is killed first. Errors are reported as an error payload.
    /// Once the report is out, the loop is told to discard task `seq`.
    fn report<W, F>(
        &self,
        job_id: JobId,
        seq: u64,
        token: CancellationToken,
        work: W,
        into_payload: F,
    ) where
        W: Future<Output = (usize, Result<Value>)> + Send + 'static,
        F: FnOnce(usize, Value) -> Payload + Send + 'static,
    {
        let bus = self.bus.clone();
        let node_id = self.node_id;
        let reported = self.reported_tx.clone();

        tokio::spawn(async move {
            let (slot, outcome) = tokio::select! {
                _ = token.cancelled() => return,
                outcome = work => outcome,
            };
            if token.is_cancelled() {
                return;
            }

            let payload = match outcome {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(node_id, job_id = %job_id, error = %e, "Work failed");
                    error_payload(e)
                }
            };
            let msg = Message::for_job(
                Endpoint::Node(node_id),
                job_id,
                into_payload(slot, payload),
            );
            let kind = msg.kind();
            match bus.send(Endpoint::Master, msg).await {
                Ok(()) => tracing::debug!(node_id, job_id = %job_id, kind = %kind, "Reported"),
                Err(e) => tracing::warn!(node_id, job_id = %job_id, error = %e, "Report failed"),
            }
            // The loop may already be gone on shutdown.
            let _ = reported.send(seq);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobSpec, MessageType};
    use serde_json::json;
    use uuid::Uuid;

    fn assign(job_id: JobId, role: Role) -> Message {
        Message::for_job(
            Endpoint::Master,
            job_id,
            Payload::NewJob {
                spec: JobSpec::default(),
                assignment: SlotAssignment {
                    role,
                    slot: 0,
                    expected_inputs: 0,
                },
            },
        )
    }

    fn fetch(job_id: JobId) -> Message {
        Message::for_job(
            Endpoint::Master,
            job_id,
            Payload::Fetch {
                directive: FetchDirective {
                    index: 0,
                    of: 1,
                    payload: json!("x"),
                },
            },
        )
    }

    #[tokio::test]
    async fn task_discarded_once_reported() {
        let bus = MessageBus::default();
        let mut master = bus.subscribe(Endpoint::Master).await;
        let mut runtime = WorkerRoleRuntime::new(1, RoleWork::builtin(Role::Fetcher), bus);
        let mut reported = runtime.reported_rx.take().unwrap();
        let job_id = Uuid::new_v4();

        runtime.handle_message(assign(job_id, Role::Fetcher)).await;
        runtime.handle_message(fetch(job_id)).await;
        assert!(runtime.task.is_some());

        let msg = master.next().await.unwrap();
        assert_eq!(msg.kind(), MessageType::ReceiveFetch);
        let seq = reported.recv().await.unwrap();
        runtime.finish_task(seq);
        assert!(runtime.task.is_none());
    }

    #[tokio::test]
    async fn late_report_signal_keeps_newer_task() {
        let bus = MessageBus::default();
        let mut master = bus.subscribe(Endpoint::Master).await;
        let mut runtime = WorkerRoleRuntime::new(1, RoleWork::builtin(Role::Fetcher), bus);
        let mut reported = runtime.reported_rx.take().unwrap();
        let job_id = Uuid::new_v4();

        runtime.handle_message(assign(job_id, Role::Fetcher)).await;
        runtime.handle_message(fetch(job_id)).await;
        master.next().await.unwrap();
        let seq = reported.recv().await.unwrap();

        // The same job hands this node another slot before the signal lands.
        runtime.handle_message(assign(job_id, Role::Fetcher)).await;
        runtime.finish_task(seq);
        let task = runtime.task.as_ref().unwrap();
        assert_eq!(task.job_id, job_id);
        assert!(!task.started);
    }
}
