//! Vista kubehub: watch wiring and normalization for the tracked resource kinds.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::info;
use vista_core::{Operation, Resource, ResourceKind};

mod emitter;
pub mod normalize;

pub use emitter::{EndpointLookup, KubeEndpoints, WatchDriver};

/// Namespaces whose objects are never emitted.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
    excluded: HashSet<String>,
}

impl NamespacePolicy {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { excluded: excluded.into_iter().map(Into::into).collect() }
    }

    pub fn excludes(&self, namespace: &str) -> bool { self.excluded.contains(namespace) }
}

impl Default for NamespacePolicy {
    fn default() -> Self { Self::new(["kube-system"]) }
}

/// A platform type that maps onto one catalog [`ResourceKind`].
pub trait Tracked:
    kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    const KIND: ResourceKind;
    /// Whether normalization needs the object's Endpoints.
    const WANTS_ENDPOINTS: bool = false;

    fn normalize(&self, endpoints: Option<&Endpoints>, at: DateTime<Utc>) -> Resource;
}

impl Tracked for Service {
    const KIND: ResourceKind = ResourceKind::Service;
    const WANTS_ENDPOINTS: bool = true;

    fn normalize(&self, endpoints: Option<&Endpoints>, at: DateTime<Utc>) -> Resource {
        normalize::normalize_service(self, endpoints, at)
    }
}

impl Tracked for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn normalize(&self, _endpoints: Option<&Endpoints>, at: DateTime<Utc>) -> Resource {
        normalize::normalize_deployment(self, at)
    }
}

impl Tracked for StatefulSet {
    const KIND: ResourceKind = ResourceKind::StatefulSet;

    fn normalize(&self, _endpoints: Option<&Endpoints>, at: DateTime<Utc>) -> Resource {
        normalize::normalize_statefulset(self, at)
    }
}

/// Build a kube client from the ambient kubeconfig or in-cluster environment.
pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("initializing Kubernetes client")
}

/// Spawn a cluster-wide watch loop for `K`, sending operations into `tx`.
///
/// The watcher reconnects with backoff on its own; the task ends only when
/// the change channel closes.
pub fn start_watcher<K: Tracked>(
    client: Client,
    policy: Arc<NamespacePolicy>,
    tx: mpsc::UnboundedSender<Operation>,
) -> tokio::task::JoinHandle<Result<()>> {
    let api: Api<K> = Api::all(client.clone());
    let endpoints: Arc<dyn EndpointLookup> = Arc::new(KubeEndpoints::new(client));
    let driver = WatchDriver::<K>::new(policy, endpoints, tx);
    tokio::spawn(async move {
        info!(kind = %K::KIND, "watcher started");
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        driver.run(stream).await
    })
}

/// Start a watcher for one kind chosen at runtime.
pub fn start_kind(
    kind: ResourceKind,
    client: Client,
    policy: Arc<NamespacePolicy>,
    tx: mpsc::UnboundedSender<Operation>,
) -> tokio::task::JoinHandle<Result<()>> {
    match kind {
        ResourceKind::Service => start_watcher::<Service>(client, policy, tx),
        ResourceKind::Deployment => start_watcher::<Deployment>(client, policy, tx),
        ResourceKind::StatefulSet => start_watcher::<StatefulSet>(client, policy, tx),
    }
}
