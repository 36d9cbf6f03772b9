//! Platform object -> canonical [`Resource`]. Pure functions; no I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use vista_core::{NetworkService, Resource, ResourceMeta, Workload};

fn resource_meta(meta: &ObjectMeta, observed_generation: Option<i64>, at: DateTime<Utc>) -> ResourceMeta {
    ResourceMeta {
        id: meta.uid.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        generation: meta.generation.unwrap_or(0),
        observed_generation: observed_generation.unwrap_or(0),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        timestamp: at,
    }
}

/// Endpoint addresses across all subsets, in platform order. Empty when there are none.
pub fn instances(endpoints: Option<&Endpoints>) -> Vec<String> {
    endpoints
        .and_then(|e| e.subsets.as_ref())
        .into_iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|addr| addr.ip.clone())
        .collect()
}

/// Container name -> image. Duplicate names: last one wins.
pub fn containers(template: &PodTemplateSpec) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(spec) = &template.spec {
        for c in &spec.containers {
            out.insert(c.name.clone(), c.image.clone().unwrap_or_default());
        }
    }
    out
}

pub fn normalize_service(svc: &Service, endpoints: Option<&Endpoints>, at: DateTime<Utc>) -> Resource {
    let spec = svc.spec.as_ref();
    let address = spec.and_then(|s| s.cluster_ip.clone()).unwrap_or_default();
    let port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.port)
        .unwrap_or(0);
    Resource::Service(NetworkService {
        meta: resource_meta(&svc.metadata, None, at),
        address,
        port,
        instances: instances(endpoints),
    })
}

pub fn normalize_deployment(d: &Deployment, at: DateTime<Utc>) -> Resource {
    let observed = d.status.as_ref().and_then(|s| s.observed_generation);
    Resource::Deployment(Workload {
        meta: resource_meta(&d.metadata, observed, at),
        containers: d.spec.as_ref().map(|s| containers(&s.template)).unwrap_or_default(),
    })
}

pub fn normalize_statefulset(s: &StatefulSet, at: DateTime<Utc>) -> Resource {
    let observed = s.status.as_ref().and_then(|st| st.observed_generation);
    Resource::StatefulSet(Workload {
        meta: resource_meta(&s.metadata, observed, at),
        containers: s.spec.as_ref().map(|sp| containers(&sp.template)).unwrap_or_default(),
    })
}
