//! Vista core types: normalized resources, change operations and catalog errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod stats;

pub use stats::{PipelineStats, StatsSnapshot};

pub mod prelude {
    pub use super::{
        CatalogError, CatalogResult, NetworkService, OpKind, Operation, PipelineStats, Resource,
        ResourceKind, ResourceMeta, Workload,
    };
}

/// Discriminator for the three tracked resource families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Service,
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Service, ResourceKind::Deployment, ResourceKind::StatefulSet];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "service",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
        }
    }

    /// Path segment / topic family used by sinks, e.g. `services`.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Service => "services",
            ResourceKind::Deployment => "deployments",
            ResourceKind::StatefulSet => "statefulsets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
            other => Err(CatalogError::UnmappedResourceKind(other.to_string())),
        }
    }
}

/// Attributes shared by every resource family.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    /// Platform-assigned uid. Opaque and immutable.
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Capture time, set at normalization.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkService {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub address: String,
    /// First declared port, 0 when the service declares none.
    pub port: i32,
    /// Backing endpoint addresses in platform order. Never absent.
    #[serde(default)]
    pub instances: Vec<String>,
}

/// Deployment or stateful group; the family is carried by the enclosing [`Resource`] variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Container name -> image reference, flattened from the pod template.
    #[serde(default)]
    pub containers: BTreeMap<String, String>,
}

/// Normalized catalog record. Closed over the three tracked families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    Service(NetworkService),
    Deployment(Workload),
    StatefulSet(Workload),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Service(_) => ResourceKind::Service,
            Resource::Deployment(_) => ResourceKind::Deployment,
            Resource::StatefulSet(_) => ResourceKind::StatefulSet,
        }
    }

    pub fn meta(&self) -> &ResourceMeta {
        match self {
            Resource::Service(s) => &s.meta,
            Resource::Deployment(w) | Resource::StatefulSet(w) => &w.meta,
        }
    }

    pub fn id(&self) -> &str { &self.meta().id }
    pub fn generation(&self) -> i64 { self.meta().generation }

    /// `namespace/name` for log lines.
    pub fn key(&self) -> String {
        let m = self.meta();
        format!("{}/{}", m.namespace, m.name)
    }

    /// Sink-facing JSON body: the resource's own field set without the kind tag.
    pub fn body_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Resource::Service(s) => serde_json::to_value(s),
            Resource::Deployment(w) | Resource::StatefulSet(w) => serde_json::to_value(w),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Add => "add",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        })
    }
}

/// A change record carrying exactly one resource snapshot. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    kind: OpKind,
    resource: Resource,
    /// Instance count the catalog held for this id before an update shrank it.
    #[serde(default, skip_serializing_if = "is_zero")]
    previous_instances: usize,
}

fn is_zero(n: &usize) -> bool { *n == 0 }

impl Operation {
    pub fn new(kind: OpKind, resource: Resource) -> Self { Self { kind, resource, previous_instances: 0 } }
    pub fn add(resource: Resource) -> Self { Self::new(OpKind::Add, resource) }
    pub fn update(resource: Resource) -> Self { Self::new(OpKind::Update, resource) }
    pub fn delete(resource: Resource) -> Self { Self::new(OpKind::Delete, resource) }

    pub fn kind(&self) -> OpKind { self.kind }
    pub fn resource(&self) -> &Resource { &self.resource }
    pub fn previous_instances(&self) -> usize { self.previous_instances }

    #[must_use]
    pub fn with_previous_instances(mut self, count: usize) -> Self {
        self.previous_instances = count;
        self
    }
}

/// Catalog-level errors returned by the repository and surfaced by the dispatch loop.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("invalid identity: resource id is empty")]
    InvalidIdentity,
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("unmapped resource kind: {0}")]
    UnmappedResourceKind(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;
