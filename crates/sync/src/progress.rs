//! Checkpoint persistence and rate limiting.

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use opnet_checksum::{ChecksumError, CheckpointHook};
use opnet_db::{DbError, IbdCounters, IbdPhase, IbdProgress, ProgressDatabase};
use parking_lot::Mutex;
use tracing::debug;

/// Tracks IBD progress and rate-limits checkpoint writes.
///
/// `current_height` always means "next height to process"; it is persisted
/// only after the work below it has been flushed, so a recorded checkpoint
/// is always a safe resume point.
pub struct ProgressTracker<D> {
    db: Arc<D>,
    inner: Mutex<TrackerInner>,
    min_blocks: u64,
    min_interval: Duration,
}

#[derive(Debug)]
struct TrackerInner {
    progress: IbdProgress,
    last_saved_height: u64,
    last_saved_at: Instant,
}

impl<D> std::fmt::Debug for ProgressTracker<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("inner", &self.inner.lock())
            .finish_non_exhaustive()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<D: ProgressDatabase> ProgressTracker<D> {
    /// Loads the persisted progress record, or initializes a fresh one at
    /// the header-download phase.
    pub async fn load_or_init(
        db: Arc<D>,
        start_height: u64,
        target_height: u64,
        min_blocks: u64,
        min_interval: Duration,
    ) -> Result<Self, DbError> {
        let progress = match db.load_progress().await? {
            Some(p) => p,
            None => {
                let fresh = IbdProgress {
                    phase: IbdPhase::HeaderDownload,
                    start_height,
                    current_height: start_height,
                    target_height,
                    counters: IbdCounters::default(),
                    last_checkpoint_at: unix_millis(),
                };
                db.store_progress(fresh).await?;
                fresh
            }
        };

        Ok(Self {
            db,
            inner: Mutex::new(TrackerInner {
                last_saved_height: progress.current_height,
                last_saved_at: Instant::now(),
                progress,
            }),
            min_blocks,
            min_interval,
        })
    }

    pub fn progress(&self) -> IbdProgress {
        self.inner.lock().progress
    }

    /// Rate-limiting policy: checkpoint when enough blocks or enough wall
    /// time have passed since the last save.
    pub fn should_save_checkpoint(&self, height: u64) -> bool {
        let inner = self.inner.lock();
        height.saturating_sub(inner.last_saved_height) >= self.min_blocks
            || inner.last_saved_at.elapsed() >= self.min_interval
    }

    /// Persists the current position of a phase. `mutate_counters` runs
    /// under the lock before the write.
    pub async fn update_progress(
        &self,
        phase: IbdPhase,
        current_height: u64,
        mutate_counters: impl FnOnce(&mut IbdCounters),
    ) -> Result<(), DbError> {
        let snapshot = {
            let mut inner = self.inner.lock();
            // A phase never moves its checkpoint backwards.
            debug_assert!(
                phase != inner.progress.phase || current_height >= inner.progress.current_height
            );
            inner.progress.phase = phase;
            inner.progress.current_height = current_height;
            inner.progress.last_checkpoint_at = unix_millis();
            mutate_counters(&mut inner.progress.counters);
            inner.last_saved_height = current_height;
            inner.last_saved_at = Instant::now();
            inner.progress
        };

        debug!(phase = %snapshot.phase, height = snapshot.current_height, "checkpoint");
        self.db.store_progress(snapshot).await
    }

    /// Records entry into a phase, resetting the cursor to `start` unless
    /// the persisted record already sits inside this phase (resume).
    pub async fn enter_phase(
        &self,
        phase: IbdPhase,
        start: u64,
        target: u64,
    ) -> Result<u64, DbError> {
        let (resume_at, snapshot) = {
            let mut inner = self.inner.lock();
            let resume_at = if inner.progress.phase == phase {
                inner.progress.current_height.max(start)
            } else {
                start
            };
            inner.progress.phase = phase;
            inner.progress.current_height = resume_at;
            inner.progress.target_height = target;
            inner.progress.last_checkpoint_at = unix_millis();
            inner.last_saved_height = resume_at;
            inner.last_saved_at = Instant::now();
            (resume_at, inner.progress)
        };
        self.db.store_progress(snapshot).await?;
        Ok(resume_at)
    }
}

/// Adapter letting the checksum engine drive checkpoints through the
/// tracker.
pub struct ChecksumCheckpointHook<D> {
    tracker: Arc<ProgressTracker<D>>,
}

impl<D> ChecksumCheckpointHook<D> {
    pub fn new(tracker: Arc<ProgressTracker<D>>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl<D: ProgressDatabase> CheckpointHook for ChecksumCheckpointHook<D> {
    fn should_save(&self, height: u64) -> bool {
        self.tracker.should_save_checkpoint(height)
    }

    async fn save(&self, height: u64) -> Result<(), ChecksumError> {
        // `height` is completed, so the next height is the resume point.
        self.tracker
            .update_progress(IbdPhase::ChecksumGeneration, height + 1, |c| {
                c.checksums_computed = height + 1;
            })
            .await
            .map_err(ChecksumError::Db)
    }
}

#[cfg(test)]
mod tests {
    use opnet_db::MemDb;

    use super::*;

    #[tokio::test]
    async fn test_fresh_tracker_persists_initial_record() {
        let db = Arc::new(MemDb::new());
        let tracker =
            ProgressTracker::load_or_init(db.clone(), 0, 100, 10, Duration::from_secs(3600))
                .await
                .unwrap();

        let p = tracker.progress();
        assert_eq!(p.phase, IbdPhase::HeaderDownload);
        assert_eq!(p.current_height, 0);
        assert_eq!(db.load_progress().await.unwrap().unwrap(), p);
    }

    #[tokio::test]
    async fn test_checkpoint_rate_limit_by_blocks() {
        let db = Arc::new(MemDb::new());
        let tracker =
            ProgressTracker::load_or_init(db, 0, 100, 10, Duration::from_secs(3600))
                .await
                .unwrap();

        assert!(!tracker.should_save_checkpoint(5));
        assert!(tracker.should_save_checkpoint(10));

        tracker
            .update_progress(IbdPhase::HeaderDownload, 10, |_| {})
            .await
            .unwrap();
        assert!(!tracker.should_save_checkpoint(15));
    }

    #[tokio::test]
    async fn test_enter_phase_resumes_within_same_phase() {
        let db = Arc::new(MemDb::new());
        let tracker =
            ProgressTracker::load_or_init(db.clone(), 0, 100, 10, Duration::from_secs(3600))
                .await
                .unwrap();

        tracker
            .update_progress(IbdPhase::ChecksumGeneration, 42, |_| {})
            .await
            .unwrap();

        // Restarting the same phase resumes at the recorded height.
        let resume = tracker
            .enter_phase(IbdPhase::ChecksumGeneration, 0, 100)
            .await
            .unwrap();
        assert_eq!(resume, 42);

        // A later phase starts at its own start height.
        let resume = tracker
            .enter_phase(IbdPhase::WitnessSync, 0, 100)
            .await
            .unwrap();
        assert_eq!(resume, 0);
    }
}
