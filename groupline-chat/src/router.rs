//! Per-group dispatch: one single-writer worker per active group.
//!
//! ```text
//!   conn A ─┐                         ┌─► session 1
//!   conn B ─┼─► [g1 queue] ─► worker ─┼─► session 2
//!   conn C ─┘                         └─► session 3
//!
//!   conn D ───► [g2 queue] ─► worker ───► ...
//! ```
//!
//! Every mutation and broadcast for a group runs as a job on that group's
//! worker, so all members observe one total order per group. Workers for
//! different groups run in parallel. A worker is evicted once its queue is
//! drained and its channel has no members.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::ChatError;
use crate::protocol::{GroupId, ServerFrame, SessionId};
use crate::registry::{DeliveryReport, SessionRegistry};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce() -> JobFuture + Send>;

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub jobs_dispatched: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub active_groups: usize,
}

#[derive(Default)]
struct RouterCounters {
    jobs_dispatched: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl RouterCounters {
    fn record(&self, report: DeliveryReport) {
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failed_deliveries
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }
}

struct GroupWorker {
    jobs: mpsc::Sender<Job>,
    /// Jobs queued or running. Only incremented while the worker map is locked.
    in_flight: Arc<AtomicUsize>,
}

type WorkerMap = Arc<RwLock<HashMap<GroupId, Arc<GroupWorker>>>>;

/// Routes group work onto per-group serialized workers.
pub struct GroupRouter {
    workers: WorkerMap,
    registry: Arc<SessionRegistry>,
    queue_capacity: usize,
    counters: Arc<RouterCounters>,
}

impl GroupRouter {
    pub fn new(registry: Arc<SessionRegistry>, queue_capacity: usize) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            registry,
            queue_capacity: queue_capacity.max(1),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the group's worker (spawning it if needed) with one job reserved.
    async fn acquire(&self, group_id: &str) -> Arc<GroupWorker> {
        // Fast path: read lock
        {
            let workers = self.workers.read().await;
            if let Some(worker) = workers.get(group_id) {
                worker.in_flight.fetch_add(1, Ordering::SeqCst);
                return worker.clone();
            }
        }

        let mut workers = self.workers.write().await;
        // Double-check after acquiring write lock
        if let Some(worker) = workers.get(group_id) {
            worker.in_flight.fetch_add(1, Ordering::SeqCst);
            return worker.clone();
        }

        let worker = self.spawn_worker(group_id.to_string());
        worker.in_flight.fetch_add(1, Ordering::SeqCst);
        workers.insert(group_id.to_string(), worker.clone());
        log::debug!("Spawned dispatch worker for group {group_id}");
        worker
    }

    fn spawn_worker(&self, group_id: GroupId) -> Arc<GroupWorker> {
        let (tx, mut rx) = mpsc::channel::<Job>(self.queue_capacity);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(GroupWorker {
            jobs: tx,
            in_flight: in_flight.clone(),
        });

        let workers = self.workers.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
                if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    evict_if_idle(&workers, &registry, &group_id).await;
                }
            }
            log::debug!("Dispatch worker for group {group_id} stopped");
        });
        worker
    }

    /// Enqueue a job on `group_id`'s worker. Waits if the queue is full.
    pub async fn dispatch<F, Fut>(&self, group_id: &str, job: F) -> Result<(), ChatError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let worker = self.acquire(group_id).await;
        let boxed: Job = Box::new(move || -> JobFuture { Box::pin(job()) });
        if worker.jobs.send(boxed).await.is_err() {
            worker.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ChatError::Connection(format!(
                "dispatch worker for {group_id} stopped"
            )));
        }
        self.counters.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run a job on `group_id`'s worker and wait for its result.
    pub async fn run<F, Fut, T>(&self, group_id: &str, job: F) -> Result<T, ChatError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(group_id, move || async move {
            let _ = tx.send(job().await);
        })
        .await?;
        rx.await
            .map_err(|_| ChatError::Connection(format!("job for {group_id} was dropped")))
    }

    /// Deliver from inside a job already running on `group_id`'s worker.
    pub async fn deliver_now(
        &self,
        group_id: &str,
        frame: &ServerFrame,
        exclude: Option<SessionId>,
    ) -> DeliveryReport {
        match self.registry.deliver(group_id, frame, exclude).await {
            Ok(report) => {
                self.counters.record(report);
                report
            }
            Err(e) => {
                log::error!("Failed to encode {} for {group_id}: {e}", frame.kind());
                DeliveryReport::default()
            }
        }
    }

    /// Evict `group_id`'s worker if it is idle and its channel is empty.
    pub async fn evict_if_empty(&self, group_id: &str) -> bool {
        evict_if_idle(&self.workers, &self.registry, group_id).await
    }

    /// Drop every worker. Queued jobs still run; new jobs spawn fresh workers.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.write().await;
        let count = workers.len();
        workers.clear();
        log::info!("Router shut down ({count} group workers released)");
    }

    pub async fn active_groups(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            jobs_dispatched: self.counters.jobs_dispatched.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
            active_groups: self.active_groups().await,
        }
    }
}

async fn evict_if_idle(workers: &WorkerMap, registry: &SessionRegistry, group_id: &str) -> bool {
    if registry.has_channel(group_id).await {
        return false;
    }
    let mut workers = workers.write().await;
    let idle = workers
        .get(group_id)
        .is_some_and(|w| w.in_flight.load(Ordering::SeqCst) == 0);
    // Membership may have changed while waiting for the write lock.
    if idle && !registry.has_channel(group_id).await {
        workers.remove(group_id);
        log::debug!("Evicted idle dispatch worker for group {group_id}");
        return true;
    }
    false
}
