//! The reconciliation role: watch caches, event routing, work queue and worker pool.
//!
//! Caches and the event router start as soon as the controller is built, so a standby
//! has warm caches when it wins leadership. Workers run only while leading:
//!
//! ```text
//! Reflector<JxTask> ─┐
//!                    ├─> route_events ─> WorkQueue ─> workers ─> Reconciler
//! Reflector<Pod>   ──┘
//! ```

pub mod backoff;
pub mod events;
pub mod pods;
pub mod queue;
pub mod reconciler;
pub mod recorder;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::api::{JxTask, ObjectKey, Pod};
use crate::cache::{wait_for_cache_sync, Reflector, Store, SyncedSignal};
use crate::client::Clients;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};

pub use backoff::Backoff;
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use status::StatusWriter;

/// One reconcile pass for a key. The seam between the worker pool and the state machine.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()>;
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        Reconciler::reconcile(self, key).await
    }
}

/// Read-only view of a running controller, shared with the health server.
#[derive(Clone)]
pub struct ControllerState {
    pub identity: String,
    pub jxtasks: Store<JxTask>,
    pub pods: Store<Pod>,
    pub queue: WorkQueue<ObjectKey>,
    pub synced: Vec<SyncedSignal>,
    leading: Arc<AtomicBool>,
}

impl ControllerState {
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    pub fn caches_synced(&self) -> bool {
        self.synced.iter().all(SyncedSignal::has_synced)
    }
}

pub struct Controller {
    config: ControllerConfig,
    state: ControllerState,
    reconciler: Arc<Reconciler>,
    informer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Build the controller and start its caches and event router on `cancel`.
    pub fn start(config: ControllerConfig, clients: Clients, cancel: CancellationToken) -> Self {
        let (jxtask_reflector, jxtask_events) = Reflector::new(
            clients.jxtasks.clone(),
            config.namespace.clone(),
            config.resync_period,
        );
        let (pod_reflector, pod_events) = Reflector::new(
            clients.pods.clone(),
            config.namespace.clone(),
            config.resync_period,
        );

        let queue = WorkQueue::new(config.requeue_backoff.clone());
        let state = ControllerState {
            identity: config.identity.clone(),
            jxtasks: jxtask_reflector.store(),
            pods: pod_reflector.store(),
            queue: queue.clone(),
            synced: vec![jxtask_reflector.synced(), pod_reflector.synced()],
            leading: Arc::new(AtomicBool::new(false)),
        };
        let reconciler = Arc::new(
            Reconciler::new(
                state.jxtasks.clone(),
                state.pods.clone(),
                clients,
                config.failure_tolerance,
            )
            .with_accelerators(config.accelerators.clone()),
        );

        let informer_handles = vec![
            tokio::spawn(jxtask_reflector.run(cancel.clone())),
            tokio::spawn(pod_reflector.run(cancel.clone())),
            tokio::spawn(events::route_events(
                jxtask_events,
                pod_events,
                queue,
                cancel,
            )),
        ];

        tracing::info!(
            namespace = %config.namespace,
            identity = %config.identity,
            "Controller caches started"
        );

        Self {
            config,
            state,
            reconciler,
            informer_handles: Mutex::new(informer_handles),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state.clone()
    }

    /// Run the worker pool until `cancel` fires. Meant to be the leading future of the
    /// leader elector. Dropping the future aborts every in-flight reconcile.
    pub async fn run_workers(&self, cancel: CancellationToken) -> Result<()> {
        let _leading = LeadingGuard::set(self.state.leading.clone());
        run_worker_pool(
            self.reconciler.clone(),
            self.state.queue.clone(),
            &self.state.synced,
            self.config.workers,
            cancel,
        )
        .await
    }

    /// Wait for the caches and the router to stop. Call after cancelling their token.
    pub async fn join(&self) {
        let handles = std::mem::take(
            &mut *self
                .informer_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Controller task failed");
            }
        }
    }
}

/// Clears the leading flag however the worker pool stops, including by abort.
struct LeadingGuard(Arc<AtomicBool>);

impl LeadingGuard {
    fn set(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LeadingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Wait for every cache to sync, then process keys with `workers` concurrent workers
/// until `cancel` fires. The queue is shut down on return; in-flight keys finish first.
///
/// Workers and their reconciles live in [`JoinSet`]s owned by this future, so dropping
/// or aborting it aborts them too.
pub async fn run_worker_pool<R: Reconcile>(
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    synced: &[SyncedSignal],
    workers: usize,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(cache) = wait_for_cache_sync(synced, &cancel).await {
        queue.shutdown();
        return Err(ControllerError::NotSynced(format!(
            "{cache} cache did not sync before shutdown"
        )));
    }

    tracing::info!(workers, "Caches synced, starting workers");
    let mut pool = JoinSet::new();
    for id in 0..workers {
        pool.spawn(worker(id, reconciler.clone(), queue.clone()));
    }

    cancel.cancelled().await;
    tracing::info!("Stopping workers");
    queue.shutdown();

    while let Some(result) = pool.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task failed");
        }
    }
    tracing::info!("Workers stopped");
    Ok(())
}

async fn worker<R: Reconcile>(id: usize, reconciler: Arc<R>, queue: WorkQueue<ObjectKey>) {
    while let Some(key) = queue.get().await {
        let task_reconciler = reconciler.clone();
        let task_key = key.clone();
        // A set of one: the reconcile runs as its own task so a panic is caught, and is
        // aborted along with this worker.
        let mut in_flight = JoinSet::new();
        in_flight.spawn(async move { task_reconciler.reconcile(&task_key).await });
        let Some(result) = in_flight.join_next().await else {
            queue.done(&key);
            continue;
        };

        match result {
            Ok(Ok(())) => queue.forget(&key),
            Ok(Err(e)) if e.is_transient() => {
                tracing::warn!(
                    worker = id,
                    jxtask = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key) + 1,
                    "Reconcile failed, requeuing"
                );
                queue.add_rate_limited(key.clone());
            }
            Ok(Err(e)) => {
                tracing::error!(worker = id, jxtask = %key, error = %e, "Reconcile failed, not retrying");
                queue.forget(&key);
            }
            Err(e) if e.is_panic() => {
                tracing::error!(worker = id, jxtask = %key, "Reconcile panicked, requeuing");
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                tracing::warn!(worker = id, jxtask = %key, error = %e, "Reconcile task cancelled");
            }
        }

        queue.done(&key);
    }
    tracing::debug!(worker = id, "Worker stopped");
}
