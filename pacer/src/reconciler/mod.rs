//! The reconciliation controller.
//!
//! Store changes to managed execution records are turned into keys on a [`workqueue::WorkQueue`] and a fixed
//! pool of workers runs each key through the [`reconcile::Reconciler`]. A periodic resync re-enqueues every
//! managed record, which also covers changes the watch stream dropped.

pub mod reconcile;
pub mod workqueue;


use crate::conf::{self, watch::ConfigWatcher, watch::HotSettings};
use crate::models::{labels, ExecutionKey};
use crate::store::{LabelSelector, StoreError, Stores, WatchEvent};
use crate::sync::{QueueError, QueueManager};
use reconcile::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workqueue::WorkQueue;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("store operation failed; {0}")]
    Store(#[from] StoreError),

    #[error("could not initialize queues; {0}")]
    Queue(#[from] QueueError),

    /// The controller could not be brought up.
    #[error("controller failed to start; {0}")]
    Startup(String),
}

/// Only records carrying the state label are ever reconciled.
fn is_managed(event: &WatchEvent) -> bool {
    event.record.is_managed()
}

fn managed_selector() -> LabelSelector {
    LabelSelector::new().exists(labels::STATE)
}

#[derive(Debug)]
pub struct Controller {
    stores: Stores,
    queues: Arc<QueueManager>,
    reconciler: Arc<Reconciler>,
    work: Arc<WorkQueue<ExecutionKey>>,
    settings: watch::Receiver<HotSettings>,
    workers: usize,
    resync_interval: Duration,
}

impl Controller {
    pub fn new(
        config: &conf::Controller,
        stores: Stores,
        settings: watch::Receiver<HotSettings>,
    ) -> Self {
        let queues = Arc::new(QueueManager::new(settings.borrow().max_concurrency));
        let reconciler = Arc::new(Reconciler::new(
            stores.clone(),
            queues.clone(),
            config.retry_config(),
        ));
        let work = Arc::new(WorkQueue::new(
            workqueue::DEFAULT_BASE_DELAY,
            config.max_backoff(),
        ));

        Self {
            stores,
            queues,
            reconciler,
            work,
            settings,
            workers: config.workers.max(1),
            resync_interval: config.resync_interval(),
        }
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.queues.clone()
    }

    /// Runs the controller until `cancel` fires. Queues are initialized from the store before any change is
    /// processed; failing to do so is fatal.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ReconcileError> {
        // Subscribe before reading the initial state so nothing written in between is missed.
        let events = self.stores.executions.watch();

        self.queues.init_from_store(&self.stores).await?;

        let mut tasks = JoinSet::new();

        tasks.spawn(watch_changes(
            events,
            self.stores.clone(),
            self.queues.clone(),
            self.work.clone(),
            cancel.clone(),
        ));

        tasks.spawn(follow_settings(
            self.settings.clone(),
            self.queues.clone(),
            self.stores.clone(),
            self.work.clone(),
            cancel.clone(),
        ));

        if !self.resync_interval.is_zero() {
            tasks.spawn(resync_periodically(
                self.resync_interval,
                self.stores.clone(),
                self.queues.clone(),
                self.work.clone(),
                cancel.clone(),
            ));
        }

        resync(&self.stores, &self.queues, &self.work).await?;

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(work(id, self.work.clone(), self.reconciler.clone()));
        }

        info!(workers = self.workers, resync_interval_secs = self.resync_interval.as_secs(),
            "controller started");

        cancel.cancelled().await;

        debug!("controller shutting down; draining work queue");
        self.work.shutdown();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "reconcile worker exited abnormally");
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "controller task exited abnormally");
            }
        }

        info!("controller stopped");
        Ok(())
    }
}

/// Brings up the whole controller: the config watcher first, then the controller itself once the watcher has
/// signalled that it is running.
pub async fn start(
    config: &conf::Config,
    path_override: Option<String>,
    stores: Stores,
    cancel: CancellationToken,
) -> Result<(), ReconcileError> {
    let (watcher, settings) = ConfigWatcher::new(config, path_override);
    let (started_tx, started_rx) = oneshot::channel();

    let watcher_handle = tokio::spawn(watcher.run(started_tx, cancel.clone()));

    started_rx.await.map_err(|_| {
        ReconcileError::Startup("config watcher exited before signalling that it started".into())
    })?;

    let controller = Controller::new(&config.controller, stores, settings);
    let result = controller.run(cancel.clone()).await;

    // The controller may have failed on its own; make sure the watcher goes down with it.
    cancel.cancel();
    if let Err(e) = watcher_handle.await {
        error!(error = %e, "config watcher exited abnormally");
    }

    result
}

/// Enqueues every managed record, plus every execution the queues still track that is no longer listed. The
/// latter were deleted without the watch stream noticing and reconciling them releases their slots.
async fn resync(
    stores: &Stores,
    queues: &QueueManager,
    work: &WorkQueue<ExecutionKey>,
) -> Result<(), StoreError> {
    let records = stores
        .executions
        .list_executions(None, &managed_selector())
        .await?;

    let mut vanished = queues.tracked();
    for record in &records {
        vanished.remove(&record.key());
    }

    debug!(count = records.len(), vanished = vanished.len(), "resyncing managed executions");

    for record in records {
        work.add(record.key());
    }

    for key in vanished {
        work.add(key);
    }

    Ok(())
}

async fn watch_changes(
    mut events: broadcast::Receiver<WatchEvent>,
    stores: Stores,
    queues: Arc<QueueManager>,
    work: Arc<WorkQueue<ExecutionKey>>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => {
                if !is_managed(&event) {
                    continue;
                }

                debug!(kind = %event.kind, namespace = event.record.namespace, name = event.record.name,
                    "execution changed");
                work.add(event.record.key());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "watch stream fell behind; resyncing");
                if let Err(e) = resync(&stores, &queues, &work).await {
                    error!(error = %e, "could not resync after missing changes");
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("watch stream closed; no further changes will be observed");
                return;
            }
        }
    }
}

async fn resync_periodically(
    interval: Duration,
    stores: Stores,
    queues: Arc<QueueManager>,
    work: Arc<WorkQueue<ExecutionKey>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // The initial resync is done during startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = resync(&stores, &queues, &work).await {
                    error!(error = %e, "periodic resync failed");
                }
            }
        }
    }
}

/// Applies changes to the global concurrency ceiling. Everything is resynced afterwards so waiting executions
/// get a chance at any new slots.
async fn follow_settings(
    mut settings: watch::Receiver<HotSettings>,
    queues: Arc<QueueManager>,
    stores: Stores,
    work: Arc<WorkQueue<ExecutionKey>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = settings.changed() => {
                if changed.is_err() {
                    debug!("settings channel closed");
                    return;
                }
            }
        }

        let max_concurrency = settings.borrow_and_update().max_concurrency;
        queues.set_max_concurrency(max_concurrency);

        if let Err(e) = resync(&stores, &queues, &work).await {
            error!(error = %e, "could not resync after settings change");
        }
    }
}

async fn work(id: usize, work: Arc<WorkQueue<ExecutionKey>>, reconciler: Arc<Reconciler>) {
    debug!(worker = id, "reconcile worker started");

    while let Some(key) = work.get().await {
        match reconciler.reconcile(&key).await {
            Ok(()) => work.forget(&key),
            Err(e) => {
                warn!(error = %e, namespace = key.namespace, name = key.name,
                    requeues = work.num_requeues(&key), "reconcile failed; retrying with backoff");
                work.add_rate_limited(key.clone());
            }
        }

        work.done(&key);
    }

    debug!(worker = id, "reconcile worker stopped");
}
