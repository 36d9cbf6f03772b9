//! Generation-gated catalog repository.
//!
//! Create is an unconditional insert-or-overwrite. Update is applied only when the
//! incoming generation is strictly greater than the stored one; anything else is a
//! stale write and is discarded without error. Callers must serialize access per id
//! (the dispatch loop is the only writer).

use std::sync::Arc;

use tracing::{debug, warn};
use vista_core::{CatalogError, CatalogResult, PipelineStats, Resource, ResourceKind};
use vista_persist::KvBackend;

pub struct Repository {
    backend: Arc<dyn KvBackend>,
    stats: Arc<PipelineStats>,
}

fn require_id(id: &str) -> CatalogResult<()> {
    if id.is_empty() { Err(CatalogError::InvalidIdentity) } else { Ok(()) }
}

fn unavailable(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::PersistenceUnavailable(e.to_string())
}

impl Repository {
    pub fn new(backend: Arc<dyn KvBackend>, stats: Arc<PipelineStats>) -> Self {
        Self { backend, stats }
    }

    fn write(&self, r: &Resource) -> CatalogResult<()> {
        let body = serde_json::to_vec(r).map_err(unavailable)?;
        self.backend.put(r.id(), &body).map_err(unavailable)
    }

    pub fn create_resource(&self, r: &Resource) -> CatalogResult<()> {
        require_id(r.id())?;
        self.write(r)?;
        self.stats.record_admitted();
        debug!(id = %r.id(), kind = %r.kind(), generation = r.generation(), "created");
        Ok(())
    }

    /// `Ok(None)` when no entry exists for `id`.
    pub fn get_resource(&self, id: &str) -> CatalogResult<Option<Resource>> {
        require_id(id)?;
        match self.backend.get(id).map_err(unavailable)? {
            Some(bytes) => {
                let r = serde_json::from_slice(&bytes)
                    .map_err(|e| unavailable(format!("decoding entry {}: {}", id, e)))?;
                Ok(Some(r))
            }
            None => Ok(None),
        }
    }

    /// Returns the applied resource, or `None` when the write was stale.
    pub fn update_resource(&self, r: &Resource) -> CatalogResult<Option<Resource>> {
        require_id(r.id())?;
        let stored = self
            .get_resource(r.id())?
            .ok_or_else(|| CatalogError::NotFound(r.id().to_string()))?;
        if r.generation() <= stored.generation() {
            self.stats.record_stale();
            debug!(id = %r.id(), incoming = r.generation(), stored = stored.generation(), "stale update discarded");
            return Ok(None);
        }
        self.write(r)?;
        self.stats.record_admitted();
        debug!(id = %r.id(), from = stored.generation(), to = r.generation(), "updated");
        Ok(Some(r.clone()))
    }

    /// Idempotent: deleting an absent id succeeds.
    pub fn delete_resource(&self, id: &str) -> CatalogResult<()> {
        require_id(id)?;
        self.backend.delete(id).map_err(unavailable)?;
        debug!(id = %id, "deleted");
        Ok(())
    }

    /// Every live entry, order unspecified. Entries that no longer decode are skipped.
    pub fn get_all_resources(&self) -> CatalogResult<Vec<Resource>> {
        let rows = self.backend.scan_all().map_err(unavailable)?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, bytes) in rows {
            match serde_json::from_slice::<Resource>(&bytes) {
                Ok(r) => out.push(r),
                Err(e) => warn!(id = %id, error = %e, "skipping undecodable catalog entry"),
            }
        }
        Ok(out)
    }

    pub fn get_all_of(&self, kind: ResourceKind) -> CatalogResult<Vec<Resource>> {
        let mut all = self.get_all_resources()?;
        all.retain(|r| r.kind() == kind);
        Ok(all)
    }
}
