//! Watch driver: turns watcher events for one resource kind into [`Operation`]s.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use vista_core::{OpKind, Operation};

use crate::{NamespacePolicy, Tracked};

/// On-demand endpoint lookup by namespace and name.
#[async_trait::async_trait]
pub trait EndpointLookup: Send + Sync {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

pub struct KubeEndpoints {
    client: Client,
}

impl KubeEndpoints {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl EndpointLookup for KubeEndpoints {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("fetching endpoints {}/{}", namespace, name))
    }
}

/// Per-kind watch loop state.
///
/// Watchers only report "applied" objects, so the driver remembers which ids it
/// has already emitted: the first sighting is framed as `Add`, later ones as `Update`.
pub struct WatchDriver<K: Tracked> {
    policy: Arc<NamespacePolicy>,
    endpoints: Arc<dyn EndpointLookup>,
    tx: mpsc::UnboundedSender<Operation>,
    seen: HashSet<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Tracked> WatchDriver<K> {
    pub fn new(
        policy: Arc<NamespacePolicy>,
        endpoints: Arc<dyn EndpointLookup>,
        tx: mpsc::UnboundedSender<Operation>,
    ) -> Self {
        Self { policy, endpoints, tx, seen: HashSet::new(), _kind: PhantomData }
    }

    /// Best-effort endpoint fetch; failures degrade to "no endpoints".
    async fn lookup_endpoints(&self, obj: &K) -> Option<Endpoints> {
        if !K::WANTS_ENDPOINTS {
            return None;
        }
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        match self.endpoints.endpoints(&ns, &name).await {
            Ok(eps) => eps,
            Err(e) => {
                counter!("vista_endpoint_lookup_failures_total", 1u64, "kind" => K::KIND.as_str());
                warn!(kind = %K::KIND, ns = %ns, name = %name, error = %e, "endpoint lookup failed; continuing without instances");
                None
            }
        }
    }

    fn send(&self, op: Operation) -> Result<()> {
        trace!(op = %op.kind(), kind = %K::KIND, id = %op.resource().id(), "emit");
        counter!("vista_ops_emitted_total", 1u64, "kind" => K::KIND.as_str());
        self.tx.send(op).map_err(|_| anyhow!("change channel closed"))
    }

    async fn applied(&mut self, obj: &K) -> Result<usize> {
        let uid = obj.uid().unwrap_or_default();
        let kind = if self.seen.contains(&uid) {
            OpKind::Update
        } else {
            let ns = obj.namespace().unwrap_or_default();
            if self.policy.excludes(&ns) {
                debug!(kind = %K::KIND, ns = %ns, name = %obj.name_any(), "skipping excluded namespace");
                return Ok(0);
            }
            if !uid.is_empty() {
                self.seen.insert(uid);
            }
            OpKind::Add
        };
        let eps = self.lookup_endpoints(obj).await;
        let resource = obj.normalize(eps.as_ref(), Utc::now());
        self.send(Operation::new(kind, resource))?;
        Ok(1)
    }

    async fn deleted(&mut self, obj: &K) -> Result<usize> {
        let uid = obj.uid().unwrap_or_default();
        let known = self.seen.remove(&uid);
        let ns = obj.namespace().unwrap_or_default();
        if !known && self.policy.excludes(&ns) {
            debug!(kind = %K::KIND, ns = %ns, name = %obj.name_any(), "skipping delete in excluded namespace");
            return Ok(0);
        }
        let eps = self.lookup_endpoints(obj).await;
        let resource = obj.normalize(eps.as_ref(), Utc::now());
        self.send(Operation::delete(resource))?;
        Ok(1)
    }

    /// Frame one watcher event. Returns the number of operations sent.
    pub async fn handle(&mut self, event: Event<K>) -> Result<usize> {
        match event {
            Event::Applied(obj) => self.applied(&obj).await,
            Event::Deleted(obj) => self.deleted(&obj).await,
            Event::Restarted(list) => {
                debug!(kind = %K::KIND, count = list.len(), "watch restart");
                let mut sent = 0;
                for obj in &list {
                    sent += self.applied(obj).await?;
                }
                Ok(sent)
            }
        }
    }

    /// Consume a watcher stream until it ends or the change channel closes.
    /// Stream errors are logged and skipped.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>> + Send,
    {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(ev) => {
                    self.handle(ev).await?;
                }
                Err(e) => {
                    counter!("vista_watch_errors_total", 1u64, "kind" => K::KIND.as_str());
                    warn!(kind = %K::KIND, error = %e, "watch stream error");
                }
            }
        }
        warn!(kind = %K::KIND, "watcher stream ended");
        Ok(())
    }
}
