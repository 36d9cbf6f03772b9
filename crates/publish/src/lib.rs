//! Vista publication fan-out.
//!
//! Every admitted [`Operation`] is handed to each configured [`Sink`]. Sinks are
//! driven concurrently and fail independently: one sink's error never blocks or
//! masks delivery to the others. Create/update deliveries run under the fan-out's
//! [`RetryPolicy`]; deletes get exactly one attempt.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, warn};
use vista_core::{OpKind, Operation, ResourceKind};

pub mod broker;
pub mod http;
pub mod registry;
mod retry;

pub use broker::{BrokerSink, Producer, RestProxyProducer, TopicMap};
pub use http::HttpSink;
pub use registry::RegistrySink;
pub use retry::RetryPolicy;

/// Per-delivery failure reported by a sink.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("encode: {0}")]
    Encode(String),
    /// The sink has no route for this resource family. Logged and skipped, never retried.
    #[error("unmapped resource kind: {0}")]
    Unmapped(ResourceKind),
}

impl SinkError {
    pub fn transport(msg: impl Into<String>) -> Self { SinkError::Transport(msg.into()) }

    /// Transport failures and 408/429/5xx responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Transport(_) => true,
            SinkError::Status { status, .. } => matches!(status, 408 | 429) || (500..600).contains(status),
            SinkError::Encode(_) | SinkError::Unmapped(_) => false,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Transport(e.to_string())
    }
}

/// A delivery target for admitted operations.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Stable label used in logs and metrics.
    fn name(&self) -> &str;

    /// Deliver one operation. A single attempt; retries are the fan-out's job.
    async fn deliver(&self, op: &Operation) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub sink: String,
    pub attempts: u32,
    pub error: SinkError,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("sink delivery failed for {} sink(s): {}", failures.len(), summarize(failures))]
    SinkDeliveryFailed { failures: Vec<SinkFailure> },
}

fn summarize(failures: &[SinkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({} attempt(s)): {}", f.sink, f.attempts, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub skipped: usize,
}

/// Dispatches operations to every configured sink.
pub struct Fanout {
    sinks: Vec<Arc<dyn Sink>>,
    policy: RetryPolicy,
}

impl Fanout {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { sinks: Vec::new(), policy }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn Sink>) { self.sinks.push(sink); }
    pub fn len(&self) -> usize { self.sinks.len() }
    pub fn is_empty(&self) -> bool { self.sinks.is_empty() }

    pub async fn publish(&self, op: &Operation) -> Result<PublishReport, PublishError> {
        let once = RetryPolicy::once();
        let policy = match op.kind() {
            OpKind::Delete => &once,
            OpKind::Add | OpKind::Update => &self.policy,
        };
        let attempts = self.sinks.iter().map(move |sink| async move {
            let started = Instant::now();
            let (res, attempts) = policy.run(move || sink.deliver(op)).await;
            histogram!("vista_sink_deliver_ms", started.elapsed().as_secs_f64() * 1000.0, "sink" => sink.name().to_string());
            (sink, res, attempts)
        });
        let results = futures::future::join_all(attempts).await;

        let mut report = PublishReport::default();
        let mut failures = Vec::new();
        for (sink, res, attempts) in results {
            match res {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(sink = %sink.name(), op = %op.kind(), id = %op.resource().id(), attempts, "delivered");
                }
                Err(SinkError::Unmapped(kind)) => {
                    report.skipped += 1;
                    warn!(sink = %sink.name(), kind = %kind, id = %op.resource().id(), "no route for resource kind; skipping");
                }
                Err(error) => {
                    counter!("vista_sink_failures_total", 1u64, "sink" => sink.name().to_string());
                    failures.push(SinkFailure { sink: sink.name().to_string(), attempts, error });
                }
            }
        }
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(PublishError::SinkDeliveryFailed { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use vista_core::{NetworkService, Resource, ResourceMeta};

    struct Flaky {
        name: String,
        calls: AtomicU32,
        failures_before_ok: u32,
        error: SinkError,
    }

    impl Flaky {
        fn new(name: &str, failures_before_ok: u32, error: SinkError) -> Arc<Self> {
            Arc::new(Self { name: name.into(), calls: AtomicU32::new(0), failures_before_ok, error })
        }
        fn calls(&self) -> u32 { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait::async_trait]
    impl Sink for Flaky {
        fn name(&self) -> &str { &self.name }
        async fn deliver(&self, _op: &Operation) -> Result<(), SinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_ok { Err(self.error.clone()) } else { Ok(()) }
        }
    }

    fn service(id: &str) -> Resource {
        Resource::Service(NetworkService {
            meta: ResourceMeta { id: id.into(), name: "web".into(), namespace: "prod".into(), generation: 1, ..Default::default() },
            ..Default::default()
        })
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default().with_attempts(3).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn delete_is_attempted_once() {
        let sink = Flaky::new("http", 1, SinkError::transport("connection reset"));
        let fanout = Fanout::new(fast_policy()).with_sink(sink.clone());
        let err = fanout.publish(&Operation::delete(service("X"))).await.unwrap_err();
        assert_eq!(sink.calls(), 1);
        let PublishError::SinkDeliveryFailed { failures } = err;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 1);
    }

    #[tokio::test]
    async fn create_retries_transient_failures() {
        let sink = Flaky::new("http", 2, SinkError::Status { status: 503, body: String::new() });
        let fanout = Fanout::new(fast_policy()).with_sink(sink.clone());
        let report = fanout.publish(&Operation::add(service("X"))).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_sink() {
        let bad = Flaky::new("bad", u32::MAX, SinkError::Status { status: 400, body: "nope".into() });
        let good = Flaky::new("good", 0, SinkError::transport("unused"));
        let fanout = Fanout::new(fast_policy()).with_sink(bad.clone()).with_sink(good.clone());
        let err = fanout.publish(&Operation::update(service("X"))).await.unwrap_err();
        assert_eq!(good.calls(), 1);
        assert_eq!(bad.calls(), 1, "non-transient status is not retried");
        let PublishError::SinkDeliveryFailed { failures } = err;
        assert_eq!(failures.iter().map(|f| f.sink.as_str()).collect::<Vec<_>>(), vec!["bad"]);
    }

    #[tokio::test]
    async fn unmapped_kind_is_skipped_not_failed() {
        let sink = Flaky::new("broker", u32::MAX, SinkError::Unmapped(ResourceKind::Service));
        let fanout = Fanout::new(fast_policy()).with_sink(sink.clone());
        let report = fanout.publish(&Operation::add(service("X"))).await.unwrap();
        assert_eq!(report, PublishReport { delivered: 0, skipped: 1 });
        assert_eq!(sink.calls(), 1);
    }

    #[test]
    fn transient_classification() {
        assert!(SinkError::transport("x").is_transient());
        assert!(SinkError::Status { status: 502, body: String::new() }.is_transient());
        assert!(SinkError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!SinkError::Status { status: 404, body: String::new() }.is_transient());
        assert!(!SinkError::Status { status: 409, body: "already exists".into() }.is_transient());
        assert!(!SinkError::Encode("bad".into()).is_transient());
    }
}
