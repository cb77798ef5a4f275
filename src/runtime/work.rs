//! Pluggable per-role work.
//!
//! Each trait receives the task's cancellation token. Implementations that
//! run for a long time should watch it; the runtime also races every call
//! against cancellation and never reports work that finished after a kill.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{FetchDirective, JobResult, Role};

/// Produces the content for one fetcher slot.
#[async_trait]
pub trait FetchExecutor: Send + Sync {
    async fn fetch(&self, directive: &FetchDirective, cancel: &CancellationToken) -> Result<Value>;
}

/// Turns the fetched inputs of one worker slot into a worker result.
#[async_trait]
pub trait Compute: Send + Sync {
    /// `inputs` are ordered by fetch slot.
    async fn compute(&self, inputs: Vec<Value>, cancel: &CancellationToken) -> Result<Value>;
}

/// Folds the worker results of a job into the collector's final result.
#[async_trait]
pub trait Aggregate: Send + Sync {
    async fn aggregate(&self, results: Vec<JobResult>, cancel: &CancellationToken)
        -> Result<Value>;
}

/// The work a node performs, which also fixes its role.
#[derive(Clone)]
pub enum RoleWork {
    Fetcher(Arc<dyn FetchExecutor>),
    Worker(Arc<dyn Compute>),
    Collector(Arc<dyn Aggregate>),
}

impl RoleWork {
    pub fn role(&self) -> Role {
        match self {
            RoleWork::Fetcher(_) => Role::Fetcher,
            RoleWork::Worker(_) => Role::Worker,
            RoleWork::Collector(_) => Role::Collector,
        }
    }

    /// Built-in work for `role`: echo the fetch target, pass inputs through,
    /// gather worker results into an array.
    pub fn builtin(role: Role) -> Self {
        match role {
            Role::Fetcher => RoleWork::Fetcher(Arc::new(StaticFetch::echo())),
            Role::Worker => RoleWork::Worker(Arc::new(PassThrough)),
            Role::Collector => RoleWork::Collector(Arc::new(ArrayAggregate)),
        }
    }
}

impl std::fmt::Debug for RoleWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoleWork({})", self.role())
    }
}

/// Payload reported in place of a result when work fails.
pub fn error_payload(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Fetches without touching the outside world.
///
/// By default it returns the directive's target; with fixed content it
/// returns that for every slot.
#[derive(Debug, Clone, Default)]
pub struct StaticFetch {
    content: Option<Value>,
}

impl StaticFetch {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn with_content(content: Value) -> Self {
        Self {
            content: Some(content),
        }
    }
}

#[async_trait]
impl FetchExecutor for StaticFetch {
    async fn fetch(
        &self,
        directive: &FetchDirective,
        _cancel: &CancellationToken,
    ) -> Result<Value> {
        Ok(self
            .content
            .clone()
            .unwrap_or_else(|| directive.target().clone()))
    }
}

/// A single input is returned as-is; several come back as an array.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Compute for PassThrough {
    async fn compute(&self, mut inputs: Vec<Value>, _cancel: &CancellationToken) -> Result<Value> {
        if inputs.len() == 1 {
            return Ok(inputs.remove(0));
        }
        Ok(Value::Array(inputs))
    }
}

/// Worker result payloads as an array, ordered by worker slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayAggregate;

#[async_trait]
impl Aggregate for ArrayAggregate {
    async fn aggregate(
        &self,
        mut results: Vec<JobResult>,
        _cancel: &CancellationToken,
    ) -> Result<Value> {
        results.sort_by_key(|r| r.slot);
        Ok(Value::Array(
            results.into_iter().map(|r| r.payload).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn directive(index: usize, payload: Value) -> FetchDirective {
        FetchDirective {
            index,
            of: 2,
            payload,
        }
    }

    #[tokio::test]
    async fn static_fetch_echoes_target() {
        let token = CancellationToken::new();
        let fetch = StaticFetch::echo();
        let content = fetch
            .fetch(&directive(1, json!(["a", "b"])), &token)
            .await
            .unwrap();
        assert_eq!(content, json!("b"));

        let fixed = StaticFetch::with_content(json!(42));
        let content = fixed.fetch(&directive(0, json!("x")), &token).await.unwrap();
        assert_eq!(content, json!(42));
    }

    #[tokio::test]
    async fn pass_through_unwraps_single_input() {
        let token = CancellationToken::new();
        assert_eq!(
            PassThrough.compute(vec![json!("a")], &token).await.unwrap(),
            json!("a")
        );
        assert_eq!(
            PassThrough
                .compute(vec![json!(1), json!(2)], &token)
                .await
                .unwrap(),
            json!([1, 2])
        );
    }

    #[tokio::test]
    async fn array_aggregate_orders_by_slot() {
        let job_id = Uuid::new_v4();
        let result = |slot: usize, payload: Value| JobResult {
            job_id,
            node_id: slot as u64 + 10,
            slot,
            produced_at: Utc::now(),
            payload,
        };
        let token = CancellationToken::new();
        let aggregate = ArrayAggregate
            .aggregate(vec![result(1, json!("b")), result(0, json!("a"))], &token)
            .await
            .unwrap();
        assert_eq!(aggregate, json!(["a", "b"]));
    }

    #[test]
    fn builtin_work_matches_role() {
        for role in Role::ALL {
            assert_eq!(RoleWork::builtin(role).role(), role);
        }
    }

    #[test]
    fn error_payload_shape() {
        assert_eq!(error_payload("boom"), json!({"error": "boom"}));
    }
}
