use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use jobmesh::api::{router, ApiState};
use jobmesh::bus::MessageBus;
use jobmesh::config::MasterConfig;
use jobmesh::master::Master;
use jobmesh::protocol::Role;

/// Helper to create a master with no nodes and nothing running
fn create_test_master(capacity_timeout_ms: u64) -> Master {
    let config = MasterConfig {
        capacity_timeout_ms,
        ..MasterConfig::default()
    };
    Master::new(config, MessageBus::default())
}

fn create_test_app(master: &Master) -> Router {
    router(ApiState {
        master: master.clone(),
    })
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_submit_and_list_jobs() {
    let master = create_test_master(5000);

    let (status, body) = send(
        create_test_app(&master),
        "POST",
        "/api/jobs",
        Some(json!({"fetchers": 2, "workers": 1, "collectors": 1, "payload": ["a", "b"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(create_test_app(&master), "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], job_id.as_str());
    assert_eq!(jobs[0]["state"], "pending");
    assert_eq!(jobs[0]["spec"]["fetchers"], 2);
}

#[tokio::test]
async fn test_submit_invalid_spec() {
    let master = create_test_master(5000);
    let (status, body) = send(
        create_test_app(&master),
        "POST",
        "/api/jobs",
        Some(json!({"fetchers": 1, "workers": 0, "collectors": 1})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("worker"));
    assert!(master.jobs().await.is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let master = create_test_master(5000);
    let missing = Uuid::new_v4();

    for (method, uri) in [
        ("GET", format!("/api/jobs/{}", missing)),
        ("DELETE", format!("/api/jobs/{}", missing)),
        ("GET", format!("/api/jobs/{}/results", missing)),
    ] {
        let (status, body) = send(create_test_app(&master), method, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }
}

#[tokio::test]
async fn test_job_status_and_results() {
    let master = create_test_master(5000);
    let job_id = master.create_job(Default::default()).await.unwrap();

    let (status, body) = send(
        create_test_app(&master),
        "GET",
        &format!("/api/jobs/{}", job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["stalled_on"], "fetcher");

    let (status, body) = send(
        create_test_app(&master),
        "GET",
        &format!("/api/jobs/{}/results", job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_stalled_job_reports_insufficient_capacity() {
    let master = create_test_master(0);
    let job_id = master.create_job(Default::default()).await.unwrap();

    let (status, body) = send(
        create_test_app(&master),
        "GET",
        &format!("/api/jobs/{}", job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("fetcher"));
}

#[tokio::test]
async fn test_kill_job_is_idempotent() {
    let master = create_test_master(5000);
    let job_id = master.create_job(Default::default()).await.unwrap();
    let uri = format!("/api/jobs/{}", job_id);

    for _ in 0..2 {
        let (status, body) = send(create_test_app(&master), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "killed");
        assert_eq!(body["job_id"], job_id.to_string());
    }
}

#[tokio::test]
async fn test_list_nodes() {
    let master = create_test_master(5000);
    master.register_node(3, Role::Worker).await.unwrap();
    master.register_node(1, Role::Fetcher).await.unwrap();

    let (status, body) = send(create_test_app(&master), "GET", "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = body.as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["id"], 1);
    assert_eq!(nodes[0]["role"], "fetcher");
    assert_eq!(nodes[0]["state"], "ready");
    assert_eq!(nodes[1]["role"], "worker");
}

#[tokio::test]
async fn test_post_message_unknown_type() {
    let master = create_test_master(5000);
    let (status, body) = send(
        create_test_app(&master),
        "POST",
        "/api/messages",
        Some(json!({"sender": "master", "type": "reboot-cluster"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("reboot-cluster"));
}

#[tokio::test]
async fn test_post_messages_drive_the_master() {
    let master = create_test_master(5000);

    let (status, _) = send(
        create_test_app(&master),
        "POST",
        "/api/messages",
        Some(json!({"sender": {"node": 9}, "type": "collector-created"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let nodes = master.nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, 9);
    assert_eq!(nodes[0].role, Role::Collector);

    let (status, _) = send(
        create_test_app(&master),
        "POST",
        "/api/messages",
        Some(json!({
            "sender": "master",
            "type": "create-job",
            "spec": {"fetchers": 1, "workers": 1, "collectors": 1}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(master.jobs().await.len(), 1);
}
