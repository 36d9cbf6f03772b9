//! Vista store: catalog repository, read-only snapshot view and the dispatch loop.
//!
//! The dispatch loop is the single consumer of the change channel. It drives each
//! operation through repository admission and then through the fan-out, one at a
//! time, so generation comparisons for an id are never evaluated concurrently.
//! Producer order across resource kinds is not preserved; only per-id admission
//! through the generation gate matters.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::histogram;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use vista_core::{CatalogError, OpKind, Operation, PipelineStats, Resource};
use vista_publish::{Fanout, PublishError, PublishReport};

mod repository;

pub use repository::Repository;

/// Immutable view of admitted entries, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub epoch: u64,
    pub items: BTreeMap<String, Arc<Resource>>,
}

/// Builds [`CatalogSnapshot`] instances from admitted operations.
#[derive(Default)]
pub struct CatalogView {
    epoch: u64,
    items: BTreeMap<String, Arc<Resource>>,
}

impl CatalogView {
    pub fn new() -> Self { Self::default() }

    pub fn seed(resources: Vec<Resource>) -> Self {
        let items = resources.into_iter().map(|r| (r.id().to_string(), Arc::new(r))).collect();
        Self { epoch: 0, items }
    }

    /// Apply one admitted operation.
    pub fn apply(&mut self, op: &Operation) {
        let r = op.resource();
        match op.kind() {
            OpKind::Add | OpKind::Update => {
                self.items.insert(r.id().to_string(), Arc::new(r.clone()));
            }
            OpKind::Delete => {
                self.items.remove(r.id());
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<CatalogSnapshot> {
        Arc::new(CatalogSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Handle for concurrent readers. Reads only; all writes go through the dispatch loop.
#[derive(Clone)]
pub struct CatalogHandle {
    snap: Arc<ArcSwap<CatalogSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CatalogHandle {
    pub fn current(&self) -> Arc<CatalogSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Admitted and delivered to every sink that had a route for it.
    Published(PublishReport),
    /// Update with a generation not newer than the stored one.
    Stale,
    /// Repository refused the operation.
    Rejected(CatalogError),
    /// Admitted, but at least one sink failed.
    PublishFailed(PublishError),
}

pub struct Dispatcher {
    repo: Repository,
    fanout: Fanout,
    stats: Arc<PipelineStats>,
    view: CatalogView,
    snap: Arc<ArcSwap<CatalogSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl Dispatcher {
    /// Build a dispatcher whose snapshot view is seeded from the repository's current contents.
    pub fn new(repo: Repository, fanout: Fanout, stats: Arc<PipelineStats>) -> (Self, CatalogHandle) {
        let view = match repo.get_all_resources() {
            Ok(existing) => {
                info!(entries = existing.len(), "catalog view seeded");
                CatalogView::seed(existing)
            }
            Err(e) => {
                warn!(error = %e, "could not seed catalog view; starting empty");
                CatalogView::new()
            }
        };
        let snap = Arc::new(ArcSwap::new(view.freeze()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = CatalogHandle { snap: Arc::clone(&snap), epoch_rx };
        (Self { repo, fanout, stats, view, snap, epoch_tx }, handle)
    }

    pub fn repository(&self) -> &Repository { &self.repo }

    fn admit(&self, op: &Operation) -> Result<bool, CatalogError> {
        let r = op.resource();
        match op.kind() {
            OpKind::Add => self.repo.create_resource(r).map(|_| true),
            OpKind::Update => self.repo.update_resource(r).map(|applied| applied.is_some()),
            OpKind::Delete => self.repo.delete_resource(r.id()).map(|_| true),
        }
    }

    /// Registry entries are keyed by instance index. When a Service shrinks or is
    /// deleted after its endpoints vanished, the stored instance set still has to
    /// be retired downstream: deletes carry the stored list, updates the stored count.
    fn carry_instances(&self, op: Operation) -> Operation {
        let incoming = match op.resource() {
            Resource::Service(s) if op.kind() != OpKind::Add => s.instances.len(),
            _ => return op,
        };
        let stored = match self.repo.get_resource(op.resource().id()) {
            Ok(Some(Resource::Service(stored))) if stored.instances.len() > incoming => stored,
            Ok(_) => return op,
            Err(e) => {
                debug!(id = %op.resource().id(), error = %e, "no stored instances to carry");
                return op;
            }
        };
        let count = stored.instances.len();
        if op.kind() == OpKind::Delete {
            debug!(id = %stored.meta.id, stored = count, "delete carries stored instances");
            let mut resource = op.resource().clone();
            if let Resource::Service(svc) = &mut resource {
                svc.instances = stored.instances;
            }
            return Operation::delete(resource);
        }
        op.with_previous_instances(count)
    }

    /// Drive one operation through admission and fan-out. Never fails; the outcome is logged and returned.
    pub async fn dispatch(&mut self, op: Operation) -> Outcome {
        let started = Instant::now();
        self.stats.record_received();
        let op = self.carry_instances(op);
        let r = op.resource();

        match self.admit(&op) {
            Ok(true) => {}
            Ok(false) => return Outcome::Stale,
            Err(e) => {
                self.stats.record_rejected();
                warn!(op = %op.kind(), kind = %r.kind(), id = %r.id(), key = %r.key(), error = %e, "operation rejected");
                return Outcome::Rejected(e);
            }
        }

        self.view.apply(&op);
        let next = self.view.freeze();
        let epoch = next.epoch;
        self.snap.store(next);
        let _ = self.epoch_tx.send(epoch);

        let outcome = match self.fanout.publish(&op).await {
            Ok(report) => {
                self.stats.record_published();
                debug!(op = %op.kind(), id = %r.id(), delivered = report.delivered, skipped = report.skipped, "published");
                Outcome::Published(report)
            }
            Err(e) => {
                self.stats.record_publish_failed();
                error!(op = %op.kind(), kind = %r.kind(), id = %r.id(), error = %e, "publish failed");
                Outcome::PublishFailed(e)
            }
        };
        histogram!("vista_dispatch_ms", started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    /// Drain the channel until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Operation>) {
        while let Some(op) = rx.recv().await {
            self.dispatch(op).await;
        }
        info!(stats = ?self.stats.snapshot(), "dispatch loop stopped");
    }
}

/// Spawn the dispatch loop. Returns the channel sender for watch loops, a read handle, and the task.
pub fn spawn_dispatch(
    repo: Repository,
    fanout: Fanout,
    stats: Arc<PipelineStats>,
) -> (mpsc::UnboundedSender<Operation>, CatalogHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel::<Operation>();
    let (dispatcher, handle) = Dispatcher::new(repo, fanout, stats);
    let task = tokio::spawn(dispatcher.run(rx));
    (tx, handle, task)
}
