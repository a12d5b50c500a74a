use std::sync::{Arc, Mutex};

use shipr_core::models::sync_state::{SyncProgress, SyncStatus};
use shipr_core::Clock;

/// Called with a fresh snapshot after every progress change.
pub type ProgressObserver = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// How one repository's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Skipped,
}

struct State {
    progress: SyncProgress,
    batch_size: usize,
}

/// Counters and ETA for one orchestrator run.
pub struct ProgressTracker {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    observer: Option<ProgressObserver>,
}

impl ProgressTracker {
    pub fn new(clock: Arc<dyn Clock>, observer: Option<ProgressObserver>) -> Self {
        Self {
            clock,
            state: Mutex::new(State {
                progress: SyncProgress::default(),
                batch_size: 1,
            }),
            observer,
        }
    }

    /// Reset for a run over `total` repositories, `batch_size` at a time.
    pub fn start(&self, total: usize, batch_size: usize) {
        let now = self.clock.now();
        self.update(|state| {
            state.batch_size = batch_size.max(1);
            state.progress = SyncProgress {
                total,
                status: SyncStatus::Running,
                started_at: Some(now),
                ..SyncProgress::default()
            };
        });
    }

    /// `count` repositories were handed to collectors.
    pub fn begin(&self, count: usize) {
        self.update(|state| {
            state.progress.current += count;
            state.progress.in_progress += count;
        });
    }

    pub fn record(&self, outcome: Outcome) {
        let now = self.clock.now();
        self.update(|state| {
            let progress = &mut state.progress;
            progress.in_progress = progress.in_progress.saturating_sub(1);
            match outcome {
                Outcome::Completed => progress.completed += 1,
                Outcome::Failed => progress.failed += 1,
                Outcome::Skipped => progress.skipped += 1,
            }
            let elapsed_ms = progress
                .started_at
                .map(|start| (now - start).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            progress.estimated_remaining_ms = estimate_remaining_ms(
                elapsed_ms,
                progress.processed(),
                progress.total,
                state.batch_size,
            );
        });
    }

    /// Close the run. Any failed repository fails the run.
    pub fn finish(&self) -> SyncProgress {
        let now = self.clock.now();
        self.update(|state| {
            let progress = &mut state.progress;
            progress.status = if progress.failed > 0 {
                SyncStatus::Failed
            } else {
                SyncStatus::Completed
            };
            progress.in_progress = 0;
            progress.finished_at = Some(now);
            progress.estimated_remaining_ms = Some(0);
        })
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.lock().progress.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut State)) -> SyncProgress {
        let snapshot = {
            let mut state = self.lock();
            f(&mut state);
            state.progress.clone()
        };
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }
        snapshot
    }
}

/// Extrapolate elapsed time over what is left.
///
/// Sequential runs (`batch_size <= 1`) scale the per-repository average by the
/// repositories remaining; batched runs scale the per-batch average by the
/// batches remaining.
pub fn estimate_remaining_ms(
    elapsed_ms: u64,
    processed: usize,
    total: usize,
    batch_size: usize,
) -> Option<u64> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    let estimate = if batch_size <= 1 {
        elapsed_ms as f64 / processed as f64 * remaining as f64
    } else {
        let batches_done = processed as f64 / batch_size as f64;
        let batches_left = remaining.div_ceil(batch_size);
        elapsed_ms as f64 / batches_done * batches_left as f64
    };
    Some(estimate.round() as u64)
}
