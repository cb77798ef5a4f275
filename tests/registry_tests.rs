use jobmesh::error::MeshError;
use jobmesh::master::registry::{NodeRegistry, NodeState};
use jobmesh::protocol::Role;
use uuid::Uuid;

#[test]
fn test_register_makes_node_ready() {
    let mut registry = NodeRegistry::new();
    assert_eq!(registry.register(1, Role::Fetcher).unwrap(), NodeState::Ready);

    let node = registry.get(1).unwrap();
    assert_eq!(node.role, Role::Fetcher);
    assert_eq!(node.state, NodeState::Ready);
    assert!(node.job.is_none());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut registry = NodeRegistry::new();
    registry.register(1, Role::Worker).unwrap();

    assert!(matches!(
        registry.register(1, Role::Collector),
        Err(MeshError::DuplicateNodeId(1))
    ));
    // The first registration stands.
    assert_eq!(registry.get(1).unwrap().role, Role::Worker);
}

#[test]
fn test_busy_and_ready_transitions() {
    let mut registry = NodeRegistry::new();
    registry.register(1, Role::Worker).unwrap();
    let job_id = Uuid::new_v4();

    registry.mark_busy(1, job_id).unwrap();
    let node = registry.get(1).unwrap();
    assert_eq!(node.state, NodeState::Busy);
    assert_eq!(node.job, Some(job_id));
    assert!(registry.nodes_by_role(Role::Worker).is_empty());

    registry.mark_ready(1).unwrap();
    assert_eq!(registry.get(1).unwrap().state, NodeState::Ready);
    assert_eq!(registry.nodes_by_role(Role::Worker), vec![1]);
}

#[test]
fn test_unknown_node_errors() {
    let mut registry = NodeRegistry::new();
    assert!(matches!(
        registry.mark_busy(5, Uuid::new_v4()),
        Err(MeshError::UnknownNode(5))
    ));
    assert!(matches!(
        registry.mark_ready(5),
        Err(MeshError::UnknownNode(5))
    ));
}

#[test]
fn test_nodes_by_role_filters_and_balances() {
    let mut registry = NodeRegistry::new();
    registry.register(1, Role::Fetcher).unwrap();
    registry.register(2, Role::Fetcher).unwrap();
    registry.register(3, Role::Worker).unwrap();

    // Node 1 has served a job before, so node 2 is preferred.
    registry.mark_busy(1, Uuid::new_v4()).unwrap();
    registry.mark_ready(1).unwrap();

    assert_eq!(registry.nodes_by_role(Role::Fetcher), vec![2, 1]);
    assert_eq!(registry.nodes_by_role(Role::Worker), vec![3]);
    assert!(registry.nodes_by_role(Role::Collector).is_empty());
}

#[test]
fn test_remove_is_idempotent_and_keeps_job() {
    let mut registry = NodeRegistry::new();
    registry.register(1, Role::Collector).unwrap();
    let job_id = Uuid::new_v4();
    registry.mark_busy(1, job_id).unwrap();

    let removed = registry.remove(1).unwrap();
    assert_eq!(removed.state, NodeState::Gone);
    assert_eq!(removed.job, Some(job_id));

    assert!(registry.remove(1).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_counts_by_role() {
    let mut registry = NodeRegistry::new();
    registry.register(1, Role::Worker).unwrap();
    registry.register(2, Role::Worker).unwrap();
    registry.register(3, Role::Fetcher).unwrap();
    registry.mark_busy(2, Uuid::new_v4()).unwrap();

    assert_eq!(registry.counts(Role::Worker), (1, 1));
    assert_eq!(registry.counts(Role::Fetcher), (1, 0));
    assert_eq!(registry.counts(Role::Collector), (0, 0));

    let ids: Vec<u64> = registry.all().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}
