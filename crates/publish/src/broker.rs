//! Message-broker sink.
//!
//! One message per operation: key `/{kind-plural}/{id}`, value the JSON-encoded
//! resource. Topics are resolved per resource family and operation through a
//! [`TopicMap`]; a family without topics is reported as [`SinkError::Unmapped`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use vista_core::{OpKind, Operation, ResourceKind};

use crate::{Sink, SinkError};

/// Created/updated/deleted topics for one resource family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyTopics {
    pub created: String,
    pub updated: String,
    pub deleted: String,
}

impl FamilyTopics {
    pub fn with_prefix(prefix: &str, kind: ResourceKind) -> Self {
        let base = format!("{}{}", prefix, kind.plural());
        Self {
            created: format!("{}.created", base),
            updated: format!("{}.updated", base),
            deleted: format!("{}.deleted", base),
        }
    }

    fn for_op(&self, op: OpKind) -> &str {
        match op {
            OpKind::Add => &self.created,
            OpKind::Update => &self.updated,
            OpKind::Delete => &self.deleted,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    families: HashMap<ResourceKind, FamilyTopics>,
}

impl TopicMap {
    pub fn empty() -> Self { Self::default() }

    /// Topics for every family, named `{prefix}{plural}.{created|updated|deleted}`.
    pub fn with_prefix(prefix: &str) -> Self {
        let families = ResourceKind::ALL
            .iter()
            .map(|k| (*k, FamilyTopics::with_prefix(prefix, *k)))
            .collect();
        Self { families }
    }

    #[must_use]
    pub fn with_family(mut self, kind: ResourceKind, topics: FamilyTopics) -> Self {
        self.families.insert(kind, topics);
        self
    }

    pub fn topic(&self, kind: ResourceKind, op: OpKind) -> Option<&str> {
        self.families.get(&kind).map(|f| f.for_op(op))
    }
}

pub fn message_key(op: &Operation) -> String {
    let r = op.resource();
    format!("/{}/{}", r.kind().plural(), r.id())
}

/// Publishes one keyed JSON record to a topic.
#[async_trait::async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, value: &serde_json::Value) -> Result<(), SinkError>;
}

/// Producer speaking the Kafka REST proxy v2 JSON format.
pub struct RestProxyProducer {
    base: String,
    client: reqwest::Client,
}

impl RestProxyProducer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building broker REST client")?;
        Ok(Self { base: base_url.trim_end_matches('/').to_string(), client })
    }
}

#[async_trait::async_trait]
impl Producer for RestProxyProducer {
    async fn send(&self, topic: &str, key: &str, value: &serde_json::Value) -> Result<(), SinkError> {
        let url = format!("{}/topics/{}", self.base, topic);
        let body = json!({ "records": [{ "key": key, "value": value }] });
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.kafka.json.v2+json")
            .body(body.to_string())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Status { status: status.as_u16(), body })
    }
}

pub struct BrokerSink {
    name: String,
    producer: Arc<dyn Producer>,
    topics: TopicMap,
}

impl BrokerSink {
    pub fn new(name: impl Into<String>, producer: Arc<dyn Producer>, topics: TopicMap) -> Self {
        Self { name: name.into(), producer, topics }
    }
}

#[async_trait::async_trait]
impl Sink for BrokerSink {
    fn name(&self) -> &str { &self.name }

    async fn deliver(&self, op: &Operation) -> Result<(), SinkError> {
        let kind = op.resource().kind();
        let topic = self.topics.topic(kind, op.kind()).ok_or(SinkError::Unmapped(kind))?;
        let value = serde_json::to_value(op.resource()).map_err(|e| SinkError::Encode(e.to_string()))?;
        self.producer.send(topic, &message_key(op), &value).await
    }
}
