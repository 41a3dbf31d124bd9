//! Cohort grouping and downstream dispatch.

use super::channel::BatchError;
use super::scheduler::BatchProcessor;
use crate::http::{is_error, ControlResponse, HttpMethod};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed per-call and per-cohort bound on downstream batch calls.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// One logical call handed to the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedUnit {
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Option<Value>,
}

impl SubmittedUnit {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod, body: Option<Value>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            method: self.method,
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub method: HttpMethod,
    pub endpoint: String,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]{}", self.method, self.endpoint)
    }
}

/// Units of one cohort sharing a [`GroupKey`], in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBatch {
    pub key: GroupKey,
    pub units: Vec<SubmittedUnit>,
}

impl SubBatch {
    pub fn envelope(&self) -> DownstreamEnvelope {
        DownstreamEnvelope {
            requests: self.units.iter().filter_map(|u| u.body.clone()).collect(),
        }
    }

    pub fn into_call(self, timeout: Duration) -> DownstreamCall {
        DownstreamCall {
            path: batch_path(&self.key.endpoint),
            method: self.key.method,
            body: self.envelope().to_body(),
            timeout,
        }
    }
}

/// Stable sort by key, then split into contiguous runs.
pub fn group_cohort(mut units: Vec<SubmittedUnit>) -> Vec<SubBatch> {
    units.sort_by(|a, b| {
        a.method
            .cmp(&b.method)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });

    let mut groups: Vec<SubBatch> = Vec::new();
    for unit in units {
        match groups.last_mut() {
            Some(group)
                if group.key.method == unit.method && group.key.endpoint == unit.endpoint =>
            {
                group.units.push(unit)
            }
            _ => groups.push(SubBatch {
                key: unit.group_key(),
                units: vec![unit],
            }),
        }
    }
    groups
}

/// `"/batch/" + endpoint` with its leading slash removed.
pub fn batch_path(endpoint: &str) -> String {
    format!("/batch/{}", endpoint.strip_prefix('/').unwrap_or(endpoint))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamEnvelope {
    pub requests: Vec<Value>,
}

impl DownstreamEnvelope {
    /// `None` when no unit carried a body; the call then goes out without one.
    pub fn to_body(&self) -> Option<Value> {
        if self.requests.is_empty() {
            None
        } else {
            Some(json!({ "requests": self.requests }))
        }
    }
}

/// One outbound batch call. Never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamCall {
    pub path: String,
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, call: DownstreamCall) -> crate::Result<ControlResponse>;
}

/// Acknowledgement for a unit: it went out as part of `batch_id`. The
/// downstream verdict is logged, not returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub batch_id: String,
}

/// Ships each group of a cohort as one downstream call.
pub struct BatchDispatcher {
    downstream: Arc<dyn Downstream>,
    call_timeout: Duration,
    cohort_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(downstream: Arc<dyn Downstream>) -> Self {
        Self {
            downstream,
            call_timeout: DEFAULT_BATCH_TIMEOUT,
            cohort_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }

    /// The per-call timeout is capped by the cohort timeout.
    pub fn with_timeouts(mut self, call_timeout: Duration, cohort_timeout: Duration) -> Self {
        self.cohort_timeout = cohort_timeout;
        self.call_timeout = call_timeout.min(cohort_timeout);
        self
    }
}

#[async_trait]
impl BatchProcessor for BatchDispatcher {
    type Item = SubmittedUnit;
    type Output = Dispatched;

    async fn process_batch(&self, units: Vec<SubmittedUnit>) -> Result<Vec<Dispatched>, BatchError> {
        let batch_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let count = units.len();
        tracing::debug!(batch_id = %batch_id, count, "batch started");

        let deadline = Instant::now() + self.cohort_timeout;
        let calls = group_cohort(units).into_iter().map(|group| {
            let key = group.key.clone();
            let size = group.units.len();
            let call = group.into_call(self.call_timeout);
            let downstream = Arc::clone(&self.downstream);
            async move {
                let outcome = tokio::time::timeout_at(deadline, downstream.call(call)).await;
                (key, size, outcome)
            }
        });

        for (key, size, outcome) in futures::future::join_all(calls).await {
            match outcome {
                Ok(Ok(resp)) if is_error(resp.status) => tracing::warn!(
                    batch_id = %batch_id,
                    group = %key,
                    status = resp.status.as_u16(),
                    body = %resp.text(),
                    "batch request unsuccessful"
                ),
                Ok(Ok(resp)) => tracing::debug!(
                    batch_id = %batch_id,
                    group = %key,
                    size,
                    status = resp.status.as_u16(),
                    "batch request delivered"
                ),
                Ok(Err(e)) => tracing::warn!(
                    batch_id = %batch_id,
                    group = %key,
                    error = %e,
                    "batch request failed"
                ),
                Err(_) => tracing::warn!(
                    batch_id = %batch_id,
                    group = %key,
                    size,
                    "batch request timed out"
                ),
            }
        }

        tracing::info!(batch_id = %batch_id, count, "batch handled");
        Ok(vec![Dispatched { batch_id }; count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::TransportError;
    use reqwest::StatusCode;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDownstream {
        calls: Mutex<Vec<DownstreamCall>>,
        fail_path: Option<String>,
        hang_path: Option<String>,
    }

    #[async_trait]
    impl Downstream for RecordingDownstream {
        async fn call(&self, call: DownstreamCall) -> crate::Result<ControlResponse> {
            self.calls.lock().unwrap().push(call.clone());
            if self.hang_path.as_deref() == Some(call.path.as_str()) {
                std::future::pending::<()>().await;
            }
            if self.fail_path.as_deref() == Some(call.path.as_str()) {
                return Err(TransportError::Other("connection refused".into()).into());
            }
            Ok(ControlResponse::new(StatusCode::OK, "{}"))
        }
    }

    fn unit(method: HttpMethod, endpoint: &str, body: Option<Value>) -> SubmittedUnit {
        SubmittedUnit::new(endpoint, method, body)
    }

    #[test]
    fn test_grouping_is_contiguous_and_stable() {
        let groups = group_cohort(vec![
            unit(HttpMethod::Post, "/a", Some(json!(1))),
            unit(HttpMethod::Get, "/b", None),
            unit(HttpMethod::Post, "/a", Some(json!(2))),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key.endpoint, "/b");
        assert_eq!(groups[1].key.endpoint, "/a");
        assert_eq!(groups[1].envelope().requests, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_same_endpoint_different_method_split() {
        let groups = group_cohort(vec![
            unit(HttpMethod::Post, "/a", None),
            unit(HttpMethod::Put, "/a", None),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_envelope_body_omitted_when_no_bodies() {
        let group = SubBatch {
            key: GroupKey {
                method: HttpMethod::Get,
                endpoint: "/b".into(),
            },
            units: vec![unit(HttpMethod::Get, "/b", None)],
        };
        let call = group.into_call(DEFAULT_BATCH_TIMEOUT);
        assert_eq!(call.path, "/batch/b");
        assert_eq!(call.body, None);
    }

    #[test]
    fn test_batch_path() {
        assert_eq!(batch_path("/process-input/openai"), "/batch/process-input/openai");
        assert_eq!(batch_path("process-input/openai"), "/batch/process-input/openai");
    }

    #[tokio::test]
    async fn test_one_call_per_group() {
        let downstream = Arc::new(RecordingDownstream::default());
        let dispatcher = BatchDispatcher::new(downstream.clone());

        let acks = dispatcher
            .process_batch(vec![
                unit(HttpMethod::Post, "/a", Some(json!({"n": 1}))),
                unit(HttpMethod::Post, "/a", Some(json!({"n": 2}))),
                unit(HttpMethod::Get, "/b", None),
            ])
            .await
            .unwrap();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|a| a == &acks[0]));
        assert_eq!(acks[0].batch_id.len(), 8);

        let mut calls = downstream.calls.lock().unwrap().clone();
        calls.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].path, "/batch/a");
        assert_eq!(
            calls[0].body,
            Some(json!({"requests": [{"n": 1}, {"n": 2}]}))
        );
        assert_eq!(calls[1].path, "/batch/b");
        assert_eq!(calls[1].method, HttpMethod::Get);
        assert_eq!(calls[1].body, None);
    }

    #[tokio::test]
    async fn test_failed_group_does_not_block_sibling() {
        let downstream = Arc::new(RecordingDownstream {
            fail_path: Some("/batch/a".into()),
            ..Default::default()
        });
        let dispatcher = BatchDispatcher::new(downstream.clone());
        let acks = dispatcher
            .process_batch(vec![
                unit(HttpMethod::Post, "/a", Some(json!(1))),
                unit(HttpMethod::Post, "/b", Some(json!(2))),
            ])
            .await
            .unwrap();
        assert_eq!(acks.len(), 2);
        assert_eq!(downstream.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_group_is_bounded_by_cohort_timeout() {
        let downstream = Arc::new(RecordingDownstream {
            hang_path: Some("/batch/slow".into()),
            ..Default::default()
        });
        let dispatcher = BatchDispatcher::new(downstream.clone())
            .with_timeouts(Duration::from_secs(5), Duration::from_millis(200));
        let started = Instant::now();
        let acks = dispatcher
            .process_batch(vec![
                unit(HttpMethod::Post, "/slow", Some(json!(1))),
                unit(HttpMethod::Post, "/fast", Some(json!(2))),
            ])
            .await
            .unwrap();
        assert_eq!(acks.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        let calls = downstream.calls.lock().unwrap();
        assert!(calls.iter().all(|c| c.timeout == Duration::from_millis(200)));
    }
}
