use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Subscription};
use crate::config::MasterConfig;
use crate::error::{MeshError, Result};
use crate::master::job::{Job, JobEvent, JobSnapshot, JobState, RecordOutcome};
use crate::master::ledger::JobLedger;
use crate::master::registry::{Node, NodeRegistry, NodeState};
use crate::protocol::{
    Endpoint, FetchDirective, JobId, JobResult, JobSpec, Message, NodeId, Payload, Role,
    SlotAssignment,
};

/// The coordinator. Owns the job ledger and node registry, and is the only
/// writer of either.
#[derive(Clone)]
pub struct Master {
    config: MasterConfig,
    bus: MessageBus,
    registry: Arc<RwLock<NodeRegistry>>,
    ledger: Arc<JobLedger>,
}

impl Master {
    pub fn new(config: MasterConfig, bus: MessageBus) -> Self {
        let ledger = Arc::new(JobLedger::with_capacity(config.max_jobs));
        Self::with_state(config, bus, Arc::new(RwLock::new(NodeRegistry::new())), ledger)
    }

    /// Build a master over existing state, e.g. fresh instances per test.
    pub fn with_state(
        config: MasterConfig,
        bus: MessageBus,
        registry: Arc<RwLock<NodeRegistry>>,
        ledger: Arc<JobLedger>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            ledger,
        }
    }

    pub fn registry(&self) -> Arc<RwLock<NodeRegistry>> {
        self.registry.clone()
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        self.ledger.clone()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Subscribe to the master inbox and spawn the event loop.
    ///
    /// The inbox is open by the time this returns, so nodes may announce
    /// themselves immediately.
    pub async fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inbox = self.bus.subscribe(Endpoint::Master).await;
        let departures = self.bus.departures();
        tokio::spawn(async move {
            self.run(inbox, departures, shutdown).await;
        })
    }

    /// Master event loop.
    ///
    /// Handles, until `shutdown` fires:
    /// - inbound protocol messages, one at a time, in arrival order
    /// - node departures published by the bus (re-dispatch)
    /// - a periodic sweep: dispatch retry, overdue stalls, pruning
    pub async fn run(
        &self,
        mut inbox: Subscription,
        mut departures: broadcast::Receiver<NodeId>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        tracing::info!("Master started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Master shutting down");
                    break;
                }

                msg = inbox.next() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        tracing::warn!("Master inbox closed");
                        break;
                    }
                },

                departed = departures.recv() => match departed {
                    Ok(node_id) => self.node_gone(node_id).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Missed node departures, sweeping registry");
                        self.reconcile_registry().await;
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = sweep.tick() => self.sweep().await,
            }
        }
    }

    // =========================================================================
    // External job API
    // =========================================================================

    /// Create a job and try to dispatch it straight away.
    pub async fn create_job(&self, spec: JobSpec) -> Result<JobId> {
        let job_id = self.ledger.create(spec).await?;
        self.dispatch_round().await;
        Ok(job_id)
    }

    /// Kill a job. Nodes still working on it are told to drop their work and
    /// return to Ready. Killing a finished job is a no-op.
    pub async fn kill_job(&self, job_id: JobId) -> Result<JobState> {
        let entry = self.ledger.entry(job_id).await?;
        let mut job = entry.lock().await;

        let before = job.state();
        let busy = job.busy_nodes();
        let state = job.transition(JobEvent::Kill)?;
        if before.is_terminal() {
            tracing::debug!(job_id = %job_id, state = %state, "Kill ignored for finished job");
            return Ok(state);
        }
        tracing::info!(job_id = %job_id, nodes = ?busy, "Job killed");

        let sends = busy
            .iter()
            .map(|&node_id| {
                (
                    node_id,
                    Message::for_job(Endpoint::Master, job_id, Payload::KillJob),
                )
            })
            .collect();
        let failed = self.send_all(sends).await;

        {
            let mut registry = self.registry.write().await;
            for &node_id in busy.iter().filter(|&n| !failed.contains(n)) {
                if let Err(e) = registry.mark_ready(node_id) {
                    tracing::debug!(node_id, error = %e, "Killed node already gone");
                }
            }
        }
        drop(job);

        self.evict(failed).await;
        self.dispatch_round().await;
        Ok(state)
    }

    /// Worker results recorded for a job, oldest first.
    pub async fn worker_results(&self, job_id: JobId) -> Result<Vec<JobResult>> {
        self.ledger.results(job_id).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobSnapshot> {
        let entry = self.ledger.entry(job_id).await?;
        let job = entry.lock().await;
        Ok(job.snapshot())
    }

    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        self.ledger
            .all_jobs()
            .await
            .iter()
            .map(Job::snapshot)
            .collect()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.registry.read().await.all().into_iter().cloned().collect()
    }

    /// Like [`Master::job`], but a job that has waited on nodes for longer
    /// than the capacity timeout is reported as
    /// [`MeshError::InsufficientCapacity`].
    pub async fn check_job(&self, job_id: JobId) -> Result<JobSnapshot> {
        let entry = self.ledger.entry(job_id).await?;
        let job = entry.lock().await;
        if let Some(stall) = job.stall() {
            if stall.is_overdue(self.capacity_timeout()) {
                return Err(MeshError::InsufficientCapacity {
                    job_id,
                    role: stall.role,
                });
            }
        }
        Ok(job.snapshot())
    }

    /// Poll until the job finishes, stalls past the capacity timeout, or
    /// `timeout` elapses. On timeout the latest snapshot is returned.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> Result<JobSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut poll = tokio::time::interval(Duration::from_millis(20));
        loop {
            poll.tick().await;
            let snapshot = self.check_job(job_id).await?;
            if snapshot.state.is_terminal() || Instant::now() >= deadline {
                return Ok(snapshot);
            }
        }
    }

    /// Admit a node and give it a chance to pick up waiting work.
    pub async fn register_node(&self, node_id: NodeId, role: Role) -> Result<NodeState> {
        let state = self.registry.write().await.register(node_id, role)?;
        self.dispatch_round().await;
        Ok(state)
    }

    /// A node left: drop it and re-dispatch whatever it had not reported.
    pub async fn node_gone(&self, node_id: NodeId) {
        self.evict(vec![node_id]).await;
    }

    fn capacity_timeout(&self) -> Duration {
        Duration::from_millis(self.config.capacity_timeout_ms)
    }

    // =========================================================================
    // Message handling
    // =========================================================================

    pub async fn handle_message(&self, msg: Message) {
        let kind = msg.kind();
        tracing::debug!(
            sender = %msg.sender,
            kind = %kind,
            job_id = ?msg.job_id,
            "Master received"
        );

        match msg.payload {
            Payload::CreateJob { spec } => match self.create_job(spec).await {
                Ok(job_id) => tracing::info!(
                    job_id = %job_id,
                    sender = %msg.sender,
                    "Job created from message"
                ),
                Err(e) => tracing::warn!(sender = %msg.sender, error = %e, "Job creation failed"),
            },

            announced @ (Payload::FetcherCreated
            | Payload::WorkerCreated
            | Payload::CollectorCreated) => {
                let Some(role) = announced.announced_role() else {
                    return;
                };
                let Some(node_id) = msg.sender.node_id() else {
                    tracing::warn!(kind = %kind, "Announcement without a node sender");
                    return;
                };
                if let Err(e) = self.register_node(node_id, role).await {
                    tracing::warn!(node_id, role = %role, error = %e, "Registration rejected");
                }
            }

            Payload::KillJob => {
                let Some(job_id) = msg.job_id else {
                    tracing::warn!(sender = %msg.sender, "kill-job without job id");
                    return;
                };
                if let Err(e) = self.kill_job(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Kill failed");
                }
            }

            Payload::ReceiveFetch { content, .. } => {
                self.on_report(&msg.sender, msg.job_id, Role::Fetcher, content).await
            }
            Payload::PushResults { payload, .. } => {
                self.on_report(&msg.sender, msg.job_id, Role::Worker, payload).await
            }
            Payload::Result { payload } => {
                self.on_report(&msg.sender, msg.job_id, Role::Collector, payload).await
            }

            Payload::GetWorkerResults => {
                let Some(job_id) = msg.job_id else {
                    tracing::warn!(sender = %msg.sender, "get-results without job id");
                    return;
                };
                self.reply_results(msg.sender, job_id).await;
            }

            Payload::NewJob { .. } | Payload::Fetch { .. } | Payload::WorkerResults { .. } => {
                tracing::warn!(
                    sender = %msg.sender,
                    kind = %kind,
                    "Unexpected message at master, ignoring"
                );
            }
        }
    }

    async fn reply_results(&self, requester: Endpoint, job_id: JobId) {
        let results = match self.worker_results(job_id).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    requester = %requester,
                    error = %e,
                    "Results query failed"
                );
                return;
            }
        };
        let Some(node_id) = requester.node_id() else {
            return;
        };

        let reply = Message::for_job(
            Endpoint::Master,
            job_id,
            Payload::WorkerResults { results },
        );
        let failed = self.send_all(vec![(node_id, reply)]).await;
        self.evict(failed).await;
    }

    /// Record a fetcher, worker or collector report and relay it onward.
    async fn on_report(
        &self,
        sender: &Endpoint,
        job_id: Option<JobId>,
        role: Role,
        payload: Value,
    ) {
        let (Some(node_id), Some(job_id)) = (sender.node_id(), job_id) else {
            tracing::warn!(sender = %sender, role = %role, "Report without node sender or job id");
            return;
        };

        let entry = match self.ledger.entry(job_id).await {
            Ok(entry) => entry,
            Err(_) => {
                tracing::info!(job_id = %job_id, node_id, "Discarding report for untracked job");
                return;
            }
        };
        let mut job = entry.lock().await;

        if let Some(open) = job.open_role(node_id) {
            if open != role {
                tracing::warn!(
                    job_id = %job_id,
                    node_id,
                    expected = %open,
                    got = %role,
                    "Report from wrong role, discarding"
                );
                return;
            }
        }

        let slot = match job.record(node_id, payload.clone()) {
            RecordOutcome::Recorded { slot, .. } => slot,
            RecordOutcome::Discarded(reason) => {
                tracing::info!(
                    job_id = %job_id,
                    node_id,
                    role = %role,
                    reason = %reason,
                    "Discarding report"
                );
                return;
            }
        };
        tracing::debug!(job_id = %job_id, node_id, role = %role, slot, "Report recorded");

        if let Err(e) = self.registry.write().await.mark_ready(node_id) {
            tracing::debug!(node_id, error = %e, "Reporting node already gone");
        }

        let sends: Vec<(NodeId, Message)> = match role {
            Role::Fetcher => {
                let worker_slot = job.spec.worker_for_fetch(slot);
                job.open_node(Role::Worker, worker_slot)
                    .map(|worker| {
                        (
                            worker,
                            Message::for_job(
                                Endpoint::Master,
                                job_id,
                                Payload::ReceiveFetch {
                                    slot,
                                    content: payload,
                                },
                            ),
                        )
                    })
                    .into_iter()
                    .collect()
            }
            Role::Worker => (0..job.spec.collectors)
                .filter_map(|c| job.open_node(Role::Collector, c))
                .map(|collector| {
                    (
                        collector,
                        Message::for_job(
                            Endpoint::Master,
                            job_id,
                            Payload::PushResults {
                                slot,
                                payload: payload.clone(),
                            },
                        ),
                    )
                })
                .collect(),
            Role::Collector => Vec::new(),
        };
        let failed = self.send_all(sends).await;

        if job.all_reported() {
            match job.transition(JobEvent::Complete) {
                Ok(state) => tracing::info!(
                    job_id = %job_id,
                    state = %state,
                    results = job.results().len(),
                    "Job completed"
                ),
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Completion rejected"),
            }
        }
        drop(job);

        self.evict(failed).await;
        self.dispatch_round().await;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Fill vacancies of running jobs first, then start pending jobs in
    /// creation order.
    pub async fn dispatch_round(&self) {
        let mut failed = Vec::new();

        for job_id in self.ledger.running_jobs().await {
            let Ok(entry) = self.ledger.entry(job_id).await else {
                continue;
            };
            let mut job = entry.lock().await;
            if job.state() == JobState::Running && !job.vacant_slots().is_empty() {
                failed.extend(self.fill_vacancies(&mut job).await);
            }
        }

        for job_id in self.ledger.pending_jobs().await {
            let Ok(entry) = self.ledger.entry(job_id).await else {
                continue;
            };
            let mut job = entry.lock().await;
            if job.state() == JobState::Pending {
                failed.extend(self.try_start(&mut job).await);
            }
        }

        self.evict(failed).await;
    }

    /// Start a pending job if every slot can be filled at once.
    async fn try_start(&self, job: &mut Job) -> Vec<NodeId> {
        let placed = {
            let mut registry = self.registry.write().await;
            let mut ready: HashMap<Role, VecDeque<NodeId>> = HashMap::new();
            for role in Role::ALL {
                let nodes = registry.nodes_by_role(role);
                let needed = job.spec.count(role);
                if nodes.len() < needed {
                    let (ready, busy) = registry.counts(role);
                    tracing::debug!(
                        job_id = %job.id,
                        role = %role,
                        ready,
                        busy,
                        needed,
                        "Not enough nodes to start job"
                    );
                    job.mark_stalled(role);
                    return Vec::new();
                }
                ready.insert(role, VecDeque::from(nodes));
            }
            Self::place(&mut registry, job, &mut ready)
        };

        if let Err(e) = job.transition(JobEvent::Start) {
            tracing::warn!(job_id = %job.id, error = %e, "Could not start job");
            return Vec::new();
        }
        job.clear_stall();
        tracing::info!(job_id = %job.id, nodes = ?job.assigned_nodes(), "Job dispatched");

        self.notify_placed(job, &placed).await
    }

    /// Re-dispatch vacated slots of a running job to other ready nodes of
    /// the same role.
    async fn fill_vacancies(&self, job: &mut Job) -> Vec<NodeId> {
        let placed = {
            let mut registry = self.registry.write().await;
            let mut ready: HashMap<Role, VecDeque<NodeId>> = Role::ALL
                .into_iter()
                .map(|role| (role, VecDeque::from(registry.nodes_by_role(role))))
                .collect();
            Self::place(&mut registry, job, &mut ready)
        };

        match job.vacant_slots().first() {
            Some(&(role, _)) => {
                tracing::debug!(job_id = %job.id, role = %role, "No ready node to take over slot");
                job.mark_stalled(role);
            }
            None => job.clear_stall(),
        }
        for (role, slot, node_id) in &placed {
            tracing::info!(job_id = %job.id, role = %role, slot, node_id, "Slot re-dispatched");
        }

        self.notify_placed(job, &placed).await
    }

    /// Assign vacant slots from `ready`, marking each chosen node busy.
    fn place(
        registry: &mut NodeRegistry,
        job: &mut Job,
        ready: &mut HashMap<Role, VecDeque<NodeId>>,
    ) -> Vec<(Role, usize, NodeId)> {
        let mut placed = Vec::new();
        for (role, slot) in job.vacant_slots() {
            let Some(node_id) = ready.get_mut(&role).and_then(VecDeque::pop_front) else {
                continue;
            };
            if registry.mark_busy(node_id, job.id).is_ok() {
                job.assign(role, slot, node_id);
                placed.push((role, slot, node_id));
            }
        }
        placed
    }

    async fn notify_placed(&self, job: &Job, placed: &[(Role, usize, NodeId)]) -> Vec<NodeId> {
        let sends = placed
            .iter()
            .flat_map(|&(role, slot, node_id)| {
                Self::slot_messages(job, role, slot)
                    .into_iter()
                    .map(move |msg| (node_id, msg))
            })
            .collect();
        self.send_all(sends).await
    }

    /// Everything a node needs to serve `slot` of `role` in `job`: the
    /// `new-job` notice, then fetch work or whatever input was already
    /// produced for the slot.
    fn slot_messages(job: &Job, role: Role, slot: usize) -> Vec<Message> {
        let spec = &job.spec;
        let expected_inputs = match role {
            Role::Fetcher => 0,
            Role::Worker => spec.expected_inputs(slot),
            Role::Collector => spec.workers,
        };
        let mut messages = vec![Message::for_job(
            Endpoint::Master,
            job.id,
            Payload::NewJob {
                spec: spec.clone(),
                assignment: SlotAssignment {
                    role,
                    slot,
                    expected_inputs,
                },
            },
        )];

        match role {
            Role::Fetcher => messages.push(Message::for_job(
                Endpoint::Master,
                job.id,
                Payload::Fetch {
                    directive: FetchDirective {
                        index: slot,
                        of: spec.fetchers,
                        payload: spec.payload.clone(),
                    },
                },
            )),
            Role::Worker => {
                messages.extend(job.fetched_for(slot).into_iter().map(|(fetch_slot, content)| {
                    Message::for_job(
                        Endpoint::Master,
                        job.id,
                        Payload::ReceiveFetch {
                            slot: fetch_slot,
                            content,
                        },
                    )
                }))
            }
            Role::Collector => messages.extend(job.results().iter().map(|r| {
                Message::for_job(
                    Endpoint::Master,
                    job.id,
                    Payload::PushResults {
                        slot: r.slot,
                        payload: r.payload.clone(),
                    },
                )
            })),
        }
        messages
    }

    /// Deliver each message; returns nodes that could not be reached.
    async fn send_all(&self, sends: Vec<(NodeId, Message)>) -> Vec<NodeId> {
        let mut failed: Vec<NodeId> = Vec::new();
        for (node_id, msg) in sends {
            if failed.contains(&node_id) {
                continue;
            }
            let kind = msg.kind();
            if let Err(e) = self.bus.send(Endpoint::Node(node_id), msg).await {
                tracing::warn!(node_id, kind = %kind, error = %e, "Delivery failed");
                failed.push(node_id);
            }
        }
        failed
    }

    // =========================================================================
    // Departures
    // =========================================================================

    /// Treat each node as gone. Re-dispatch may hit further unreachable
    /// nodes; those are worked off here too.
    async fn evict(&self, nodes: Vec<NodeId>) {
        let mut pending = nodes;
        while let Some(node_id) = pending.pop() {
            let failed = self.depart(node_id).await;
            pending.extend(failed);
        }
    }

    async fn depart(&self, node_id: NodeId) -> Vec<NodeId> {
        let removed = self.registry.write().await.remove(node_id);
        self.bus.disconnect(Endpoint::Node(node_id)).await;

        let Some(job_id) = removed.and_then(|node| node.job) else {
            return Vec::new();
        };
        let Ok(entry) = self.ledger.entry(job_id).await else {
            return Vec::new();
        };
        let mut job = entry.lock().await;
        let Some((role, slot)) = job.vacate(node_id) else {
            return Vec::new();
        };
        if job.state() != JobState::Running {
            return Vec::new();
        }

        tracing::warn!(
            job_id = %job_id,
            node_id,
            role = %role,
            slot,
            "Node left mid-job, re-dispatching"
        );
        self.fill_vacancies(&mut job).await
    }

    /// Drop registered nodes the bus no longer knows. Used when departure
    /// notifications were missed.
    async fn reconcile_registry(&self) {
        let known: Vec<NodeId> = self.registry.read().await.all().iter().map(|n| n.id).collect();
        let mut gone = Vec::new();
        for node_id in known {
            if !self.bus.is_connected(Endpoint::Node(node_id)).await {
                gone.push(node_id);
            }
        }
        self.evict(gone).await;
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    async fn sweep(&self) {
        self.dispatch_round().await;

        let timeout = self.capacity_timeout();
        let mut waiting = self.ledger.pending_jobs().await;
        waiting.extend(self.ledger.running_jobs().await);
        for job_id in waiting {
            let Ok(entry) = self.ledger.entry(job_id).await else {
                continue;
            };
            let overdue = entry.lock().await.take_overdue_stall(timeout);
            if let Some(role) = overdue {
                let error = MeshError::InsufficientCapacity { job_id, role };
                tracing::warn!(job_id = %job_id, error = %error, "Job stalled waiting for nodes");
            }
        }

        let retention = Duration::from_secs(self.config.finished_retention_secs);
        let pruned = self.ledger.prune_finished(retention).await;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished jobs");
        }
    }
}
