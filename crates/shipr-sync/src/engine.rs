use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use shipr_core::config::ShiprConfig;
use shipr_core::error::ShiprError;
use shipr_core::models::repository::{Repository, RepositoryId, TenantId};
use shipr_core::models::sync_state::{CollectionStats, SyncProgress, SyncResult};
use shipr_core::Clock;
use shipr_db::{ops, Store};
use shipr_host::SourceFactory;
use shipr_pool::{PoolConfig, Task, TaskId, TaskPool, TaskResult};

use crate::collector::Collector;
use crate::progress::{Outcome, ProgressObserver, ProgressTracker};

type Registry = Arc<Mutex<HashSet<RepositoryId>>>;
type Tally = Arc<Mutex<CollectionStats>>;

/// Repositories this engine is collecting right now. Released on drop.
struct InFlight {
    registry: Registry,
    ids: Vec<RepositoryId>,
}

impl InFlight {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            ids: Vec::new(),
        }
    }

    /// Claim `id`; false if another run already holds it.
    fn claim(&mut self, id: &RepositoryId) -> bool {
        let claimed = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone());
        if claimed {
            self.ids.push(id.clone());
        }
        claimed
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in &self.ids {
            registry.remove(id);
        }
    }
}

/// Drives collectors for one or many repositories.
///
/// Every repository attempted yields a [`SyncResult`], stored in the sync
/// history; a failing repository never stops the others. `sync_all` works in
/// batches of `concurrency`, each batch running through a [`TaskPool`] and
/// finishing before the next begins.
pub struct SyncEngine {
    store: Arc<Store>,
    sources: Arc<dyn SourceFactory>,
    clock: Arc<dyn Clock>,
    page_size: u32,
    pool: PoolConfig,
    in_flight: Registry,
    latest: Arc<Mutex<SyncProgress>>,
    observer: Option<ProgressObserver>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        sources: Arc<dyn SourceFactory>,
        clock: Arc<dyn Clock>,
        config: &ShiprConfig,
    ) -> Self {
        Self {
            store,
            sources,
            clock,
            page_size: config.page_size,
            pool: PoolConfig::from_settings(&config.pool),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            latest: Arc::new(Mutex::new(SyncProgress::default())),
            observer: None,
        }
    }

    /// Call `observer` with a progress snapshot after every change.
    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Progress of the most recent run.
    pub fn progress(&self) -> SyncProgress {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Collect one repository. `force_full` resets its watermark first.
    pub async fn sync_one(
        &self,
        id: &RepositoryId,
        force_full: bool,
    ) -> Result<SyncResult, ShiprError> {
        let repository = self
            .store
            .read(|conn| ops::get_repository(conn, id))?
            .ok_or_else(|| ShiprError::RepositoryNotFound {
                name: id.to_string(),
            })?;

        let tracker = self.tracker();
        tracker.start(1, 1);
        let mut results = self
            .run_batch(vec![repository], force_full, &tracker)
            .await?;
        tracker.finish();

        results.pop().ok_or_else(|| {
            ShiprError::Other(format!("sync of {id} produced no result"))
        })
    }

    /// Collect every repository of `tenant`, `concurrency` at a time.
    pub async fn sync_all(
        &self,
        tenant: &TenantId,
        force_full: bool,
        concurrency: usize,
    ) -> Result<Vec<SyncResult>, ShiprError> {
        let repositories = self
            .store
            .read(|conn| ops::list_repositories(conn, tenant))?;
        if repositories.is_empty() {
            return Err(ShiprError::NoRepositories {
                tenant: tenant.to_string(),
            });
        }

        let batch_size = concurrency.max(1);
        let tracker = self.tracker();
        tracker.start(repositories.len(), batch_size);
        tracing::info!(
            "syncing {} repositories for {tenant}, {batch_size} at a time{}",
            repositories.len(),
            if force_full { " (full)" } else { "" }
        );

        let mut results = Vec::with_capacity(repositories.len());
        for batch in repositories.chunks(batch_size) {
            let batch_results = self.run_batch(batch.to_vec(), force_full, &tracker).await?;
            results.extend(batch_results);
        }

        let progress = tracker.finish();
        tracing::info!(
            "sync {}: {} completed, {} failed, {} skipped",
            progress.status,
            progress.completed,
            progress.failed,
            progress.skipped
        );
        Ok(results)
    }

    /// Progress tracker for a new run, mirrored into [`progress`](Self::progress).
    fn tracker(&self) -> ProgressTracker {
        let latest = self.latest.clone();
        let observer = self.observer.clone();
        let mirror: ProgressObserver = Arc::new(move |progress: &SyncProgress| {
            *latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = progress.clone();
            if let Some(observer) = &observer {
                observer(progress);
            }
        });
        ProgressTracker::new(self.clock.clone(), Some(mirror))
    }

    /// Run one batch concurrently. Results come back in `batch` order.
    ///
    /// Each repository gets one tally shared by all of its attempts, so the
    /// result counts every row written, including rows from attempts the pool
    /// retried or that failed outright.
    async fn run_batch(
        &self,
        batch: Vec<Repository>,
        force_full: bool,
        tracker: &ProgressTracker,
    ) -> Result<Vec<SyncResult>, ShiprError> {
        let mut slots: Vec<Option<SyncResult>> = vec![None; batch.len()];
        let mut guard = InFlight::new(self.in_flight.clone());
        let mut pool = TaskPool::new(self.pool.clone().with_size(batch.len()));
        let mut submitted = Vec::new();
        let mut tallies: HashMap<RepositoryId, Tally> = HashMap::new();

        for (slot, mut repository) in batch.into_iter().enumerate() {
            if !guard.claim(&repository.id) {
                tracing::warn!("{} is already syncing, skipping", repository.full_name);
                slots[slot] = Some(SyncResult::skipped(
                    repository.id.clone(),
                    repository.full_name.clone(),
                    "already in progress",
                    self.clock.now(),
                ));
                tracker.record(Outcome::Skipped);
                continue;
            }
            if force_full {
                self.store
                    .write(|tx| ops::reset_watermark(tx, &repository.id))?;
                repository.last_sync_at = Some(DateTime::<Utc>::UNIX_EPOCH);
            }
            let tally = Tally::default();
            tallies.insert(repository.id.clone(), tally.clone());
            submitted.push(Submitted {
                slot,
                id: repository.id.clone(),
                name: repository.full_name.clone(),
                tally,
            });
            pool.submit(Task::new("sync", repository));
        }

        tracker.begin(submitted.len());
        let started_at = self.clock.now();
        let mut finished_at: HashMap<TaskId, DateTime<Utc>> = HashMap::new();
        let store = self.store.clone();
        let sources = self.sources.clone();
        let clock = self.clock.clone();
        let page_size = self.page_size;
        let outcomes = pool
            .run_all_with(
                move |repository: Repository| {
                    let store = store.clone();
                    let sources = sources.clone();
                    let clock = clock.clone();
                    let tally = tallies.get(&repository.id).cloned().unwrap_or_default();
                    async move {
                        let source = sources.source_for(&repository)?;
                        Collector::new(store, source, clock, repository, page_size)
                            .with_tally(tally)
                            .sync_all()
                            .await
                    }
                },
                |outcome: &TaskResult<CollectionStats>| {
                    finished_at.insert(outcome.task_id, self.clock.now());
                    tracker.record(if outcome.success() {
                        Outcome::Completed
                    } else {
                        Outcome::Failed
                    });
                },
            )
            .await;
        drop(guard);

        for (submitted, outcome) in submitted.into_iter().zip(outcomes) {
            let finished = finished_at
                .get(&outcome.task_id)
                .copied()
                .unwrap_or_else(|| self.clock.now());
            let slot = submitted.slot;
            slots[slot] = Some(submitted.into_result(outcome, started_at, finished));
        }

        let results: Vec<SyncResult> = slots.into_iter().flatten().collect();
        for result in &results {
            if result.success {
                tracing::info!("{}", result.message);
            } else if !result.skipped {
                tracing::warn!("{}: {}", result.message, result.errors.join("; "));
            }
            self.store.write(|tx| ops::insert_sync_result(tx, result))?;
        }
        Ok(results)
    }
}

/// A repository handed to the pool, and where its result goes.
struct Submitted {
    slot: usize,
    id: RepositoryId,
    name: String,
    tally: Tally,
}

impl Submitted {
    fn into_result(
        self,
        outcome: TaskResult<CollectionStats>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> SyncResult {
        let stats = *self
            .tally
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome.outcome {
            Ok(_) => SyncResult::succeeded(self.id, self.name, stats, started_at, finished_at),
            Err(failure) => SyncResult::failed(
                self.id,
                self.name,
                vec![failure.to_string()],
                started_at,
                finished_at,
            )
            .with_stats(stats),
        }
    }
}
