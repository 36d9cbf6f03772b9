//! Service-registry agent sink (Consul agent HTTP API shape).
//!
//! Each backing instance of a service is registered as its own entry keyed
//! `{id}-{index}`. Workloads carry no network identity and are ignored.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::trace;
use vista_core::{NetworkService, OpKind, Operation, Resource};

use crate::{Sink, SinkError};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Registration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "Meta")]
    pub meta: BTreeMap<String, String>,
}

/// One registration per instance, in instance order.
pub fn registrations(svc: &NetworkService) -> Vec<Registration> {
    svc.instances
        .iter()
        .enumerate()
        .map(|(i, addr)| Registration {
            id: instance_id(&svc.meta.id, i),
            name: svc.meta.name.clone(),
            address: addr.clone(),
            port: svc.port,
            meta: BTreeMap::from([
                ("namespace".to_string(), svc.meta.namespace.clone()),
                ("generation".to_string(), svc.meta.generation.to_string()),
            ]),
        })
        .collect()
}

pub fn instance_id(id: &str, index: usize) -> String {
    format!("{}-{}", id, index)
}

pub struct RegistrySink {
    name: String,
    base: String,
    client: reqwest::Client,
}

impl RegistrySink {
    pub fn new(agent_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building registry agent client")?;
        Ok(Self::with_client(agent_url, client))
    }

    pub fn with_client(agent_url: &str, client: reqwest::Client) -> Self {
        let base = agent_url.trim_end_matches('/').to_string();
        Self { name: format!("registry:{}", base), base, client }
    }

    async fn register(&self, reg: &Registration) -> Result<(), SinkError> {
        let url = format!("{}/v1/agent/service/register", self.base);
        check(self.client.put(&url).json(reg).send().await?).await
    }

    async fn deregister(&self, instance: &str) -> Result<(), SinkError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base, instance);
        check(self.client.put(&url).send().await?).await
    }

    /// Attempt every index in the range; report the first failure.
    async fn deregister_range(&self, id: &str, indices: Range<usize>) -> Result<(), SinkError> {
        let mut first_err = None;
        for i in indices {
            if let Err(e) = self.deregister(&instance_id(id, i)).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

async fn check(resp: reqwest::Response) -> Result<(), SinkError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SinkError::Status { status: status.as_u16(), body })
}

#[async_trait::async_trait]
impl Sink for RegistrySink {
    fn name(&self) -> &str { &self.name }

    async fn deliver(&self, op: &Operation) -> Result<(), SinkError> {
        let svc = match op.resource() {
            Resource::Service(svc) => svc,
            other => {
                trace!(kind = %other.kind(), id = %other.id(), "registry ignores workloads");
                return Ok(());
            }
        };
        match op.kind() {
            OpKind::Add | OpKind::Update => {
                for reg in registrations(svc) {
                    self.register(&reg).await?;
                }
                // Indices past the new instance count were registered by an earlier generation.
                self.deregister_range(&svc.meta.id, svc.instances.len()..op.previous_instances()).await
            }
            OpKind::Delete => self.deregister_range(&svc.meta.id, 0..svc.instances.len()).await,
        }
    }
}
