use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use shipr_core::error::ShiprError;
use shipr_core::models::activity::{Commit, PullRequest, PullRequestId, Review};
use shipr_core::models::repository::Repository;
use shipr_core::models::sync_state::CollectionStats;
use shipr_core::Clock;
use shipr_db::ops::{self, UpsertOutcome};
use shipr_db::Store;
use shipr_host::{ActivitySource, CommitPayload, PullRequestPayload, ReviewPayload};

use crate::identity;
use crate::strategy::Strategy;

/// Pull requests and reviews written by one collection phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullRequestCounts {
    pub pull_requests: u32,
    pub reviews: u32,
}

/// Incremental collection of one repository's activity.
///
/// Fetches everything newer than the repository's watermark, page by page in
/// cursor order, writing each page before asking for the next. Rows are keyed
/// by their natural keys, so re-running over the same window writes nothing new.
///
/// Every written row is counted into a tally as it lands. The tally can be
/// shared between collectors, so rows stored by an attempt that later fails
/// are still counted when a retry finishes the job.
pub struct Collector {
    pub(crate) store: Arc<Store>,
    pub(crate) source: Arc<dyn ActivitySource>,
    clock: Arc<dyn Clock>,
    pub(crate) repository: Repository,
    pub(crate) page_size: u32,
    strategy: Mutex<Option<Strategy>>,
    tally: Arc<Mutex<CollectionStats>>,
}

impl Collector {
    pub fn new(
        store: Arc<Store>,
        source: Arc<dyn ActivitySource>,
        clock: Arc<dyn Clock>,
        repository: Repository,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            repository,
            page_size: page_size.clamp(1, 100),
            strategy: Mutex::new(None),
            tally: Arc::new(Mutex::new(CollectionStats::default())),
        }
    }

    /// Count into `tally` instead of a private one.
    pub fn with_tally(mut self, tally: Arc<Mutex<CollectionStats>>) -> Self {
        self.tally = tally;
        self
    }

    /// Rows written so far into this collector's tally.
    pub fn tally(&self) -> CollectionStats {
        *self.lock_tally()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut CollectionStats)) {
        update(&mut self.lock_tally());
    }

    fn lock_tally(&self) -> std::sync::MutexGuard<'_, CollectionStats> {
        self.tally
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Lower time bound for remote queries; `None` fetches full history.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        if self.repository.needs_full_sync() {
            None
        } else {
            self.repository.last_sync_at
        }
    }

    /// The strategy in use, asking the source on first call.
    pub async fn strategy(&self) -> Strategy {
        let memo = *self.lock_strategy();
        if let Some(strategy) = memo {
            return strategy;
        }
        let detected = if self.source.supports_bulk_query().await {
            Strategy::Bulk
        } else {
            Strategy::PerItem
        };
        tracing::debug!("{}: using {detected} collection", self.repository.full_name);
        *self.lock_strategy() = Some(detected);
        detected
    }

    fn lock_strategy(&self) -> std::sync::MutexGuard<'_, Option<Strategy>> {
        self.strategy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switch to per-item collection for the rest of this run.
    fn fall_back(&self, error: &ShiprError) {
        tracing::warn!(
            "{}: bulk query failed ({error}), falling back to per-item collection",
            self.repository.full_name
        );
        *self.lock_strategy() = Some(Strategy::PerItem);
    }

    /// New commits written by this call.
    pub async fn collect_commits(&self) -> Result<u32, ShiprError> {
        let before = self.tally();
        if self.strategy().await == Strategy::Bulk {
            match self.bulk_commits().await {
                Ok(()) => return Ok(written_since(&before, &self.tally()).commit_count),
                Err(e) if !falls_back(&e) => return Err(e),
                Err(e) => self.fall_back(&e),
            }
        }
        self.per_item_commits().await?;
        Ok(written_since(&before, &self.tally()).commit_count)
    }

    pub async fn collect_pull_requests_and_reviews(&self) -> Result<PullRequestCounts, ShiprError> {
        let before = self.tally();
        let counts = || {
            let written = written_since(&before, &self.tally());
            PullRequestCounts {
                pull_requests: written.pull_request_count,
                reviews: written.review_count,
            }
        };
        if self.strategy().await == Strategy::Bulk {
            match self.bulk_pull_requests().await {
                Ok(()) => return Ok(counts()),
                Err(e) if !falls_back(&e) => return Err(e),
                Err(e) => self.fall_back(&e),
            }
        }
        self.per_item_pull_requests().await?;
        Ok(counts())
    }

    /// Both phases, then the watermark. A failed phase leaves the watermark alone.
    pub async fn sync_all(&self) -> Result<CollectionStats, ShiprError> {
        tracing::info!(
            "collecting {} since {}",
            self.repository.full_name,
            self.since()
                .map(|s| s.to_rfc3339())
                .unwrap_or_else(|| "the beginning".to_string())
        );
        let before = self.tally();
        self.collect_commits().await?;
        self.collect_pull_requests_and_reviews().await?;
        self.update_last_sync_at()?;
        Ok(written_since(&before, &self.tally()))
    }

    /// Advance the watermark to now. Never moves it backwards.
    pub fn update_last_sync_at(&self) -> Result<bool, ShiprError> {
        let now = self.clock.now();
        let id = self.repository.id.clone();
        let moved = self
            .store
            .write(|tx| ops::advance_watermark(tx, &id, &now))?;
        if !moved {
            tracing::debug!(
                "{}: watermark already past {now}",
                self.repository.full_name
            );
        }
        Ok(moved)
    }

    // ── Item application: normalize, resolve identities, write ──

    /// Returns 1 if a new commit row was written. Bad items are logged and skipped.
    pub(crate) fn apply_commit(&self, payload: &CommitPayload) -> u32 {
        let remote = match payload.normalize() {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("{}: skipping commit: {e}", self.repository.full_name);
                return 0;
            }
        };
        let now = self.clock.now();
        let repository_id = self.repository.id.clone();
        let written = self.store.write(|tx| {
            let author_id = match &remote.author {
                Some(signal) => identity::resolve(tx, signal, now)?,
                None => None,
            };
            let committer_id = match &remote.committer {
                Some(signal) => identity::resolve(tx, signal, now)?,
                None => None,
            };
            ops::insert_commit(
                tx,
                &Commit {
                    sha: remote.sha.clone(),
                    repository_id,
                    author_id,
                    committer_id,
                    message: remote.message.clone(),
                    committed_at: remote.committed_at,
                    additions: remote.additions,
                    deletions: remote.deletions,
                },
            )
        });
        match written {
            Ok(inserted) => u32::from(inserted),
            Err(e) => {
                tracing::warn!(
                    "{}: failed to store commit {}: {e}",
                    self.repository.full_name,
                    remote.sha
                );
                0
            }
        }
    }

    /// Upsert a pull request. Returns its stored id and whether it counts as
    /// written (inserted or lifecycle updated), or `None` if it was skipped.
    pub(crate) fn apply_pull_request(
        &self,
        payload: &PullRequestPayload,
    ) -> Option<(PullRequestId, bool)> {
        let remote = match payload.normalize() {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("{}: skipping pull request: {e}", self.repository.full_name);
                return None;
            }
        };
        let now = self.clock.now();
        let repository_id = self.repository.id.clone();
        let written = self.store.write(|tx| {
            let author_id = match &remote.author {
                Some(signal) => identity::resolve(tx, signal, now)?,
                None => None,
            };
            ops::upsert_pull_request(
                tx,
                &PullRequest {
                    id: PullRequestId::new(),
                    repository_id,
                    number: remote.number,
                    title: remote.title.clone(),
                    author_id,
                    state: remote.state,
                    created_at: remote.created_at,
                    updated_at: remote.updated_at,
                    closed_at: remote.closed_at,
                    merged_at: remote.merged_at,
                    additions: remote.additions,
                    deletions: remote.deletions,
                    changed_files: remote.changed_files,
                },
            )
        });
        match written {
            Ok((id, outcome)) => Some((id, outcome != UpsertOutcome::Unchanged)),
            Err(e) => {
                tracing::warn!(
                    "{}: failed to store pull request #{}: {e}",
                    self.repository.full_name,
                    remote.number
                );
                None
            }
        }
    }

    /// Returns 1 if a new review row was written.
    pub(crate) fn apply_review(&self, pull_request: &PullRequestId, payload: &ReviewPayload) -> u32 {
        let remote = match payload.normalize() {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("{}: skipping review: {e}", self.repository.full_name);
                return 0;
            }
        };
        let now = self.clock.now();
        let written = self.store.write(|tx| {
            let reviewer_id = match &remote.reviewer {
                Some(signal) => identity::resolve(tx, signal, now)?,
                None => None,
            };
            ops::insert_review(
                tx,
                &Review {
                    remote_id: remote.remote_id.clone(),
                    pull_request_id: pull_request.clone(),
                    reviewer_id,
                    state: remote.state,
                    submitted_at: remote.submitted_at,
                },
            )
        });
        match written {
            Ok(inserted) => u32::from(inserted),
            Err(e) => {
                tracing::warn!(
                    "{}: failed to store review {}: {e}",
                    self.repository.full_name,
                    remote.remote_id
                );
                0
            }
        }
    }
}

fn written_since(before: &CollectionStats, after: &CollectionStats) -> CollectionStats {
    CollectionStats {
        commit_count: after.commit_count.saturating_sub(before.commit_count),
        pull_request_count: after
            .pull_request_count
            .saturating_sub(before.pull_request_count),
        review_count: after.review_count.saturating_sub(before.review_count),
    }
}

/// Bulk failures that per-item collection might get past. Rate limits and
/// permanent errors would hit the fallback just the same.
fn falls_back(error: &ShiprError) -> bool {
    !error.is_rate_limited() && !error.is_permanent()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use shipr_core::models::activity::{PrState, ReviewState};
    use shipr_core::models::repository::{RepositoryId, TenantId};
    use shipr_core::ManualClock;
    use shipr_db::ops::ActivityScope;
    use shipr_host::testing::{
        ScriptedCommit, ScriptedPullRequest, ScriptedReview, ScriptedSource, ScriptedUser,
    };

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, hour, 0, 0).unwrap()
    }

    fn activity() -> ScriptedSource {
        let ada = ScriptedUser::account("ada", 1);
        let bob = ScriptedUser::account("bob", 2);
        let eve = ScriptedUser::email_only("Eve", "eve@example.com");
        ScriptedSource::new()
            .with_commits([
                ScriptedCommit::new("a1", at(1, 8)).by(ada.clone()).lines(12, 3),
                ScriptedCommit::new("b1", at(2, 8)).by(bob.clone()).lines(4, 4),
                ScriptedCommit::new("e1", at(3, 8)).by(eve).lines(1, 0),
                ScriptedCommit::new("a2", at(4, 8)).by(ada.clone()).lines(7, 1),
                ScriptedCommit::new("x1", at(5, 8)),
            ])
            .with_pull_requests([
                ScriptedPullRequest::opened(1, at(1, 9))
                    .by(ada.clone())
                    .review(ScriptedReview::new(11, "CHANGES_REQUESTED", bob.clone(), at(1, 11)))
                    .review(ScriptedReview::approved(12, bob.clone(), at(1, 13)))
                    .merged(at(1, 15)),
                ScriptedPullRequest::opened(2, at(2, 9)).by(bob.clone()).closed(at(3, 9)),
                ScriptedPullRequest::opened(3, at(4, 9))
                    .by(bob)
                    .review(ScriptedReview::new(13, "COMMENTED", ada, at(4, 10))),
            ])
    }

    struct Harness {
        store: Arc<Store>,
        clock: Arc<ManualClock>,
        repository: Repository,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(Store::open_memory().unwrap());
            let repository = Repository::new(
                TenantId::new("acme"),
                "acme/widgets".to_string(),
                "https://github.com/acme/widgets.git".to_string(),
            );
            store
                .write(|tx| ops::insert_repository(tx, &repository))
                .unwrap();
            Self {
                store,
                clock: Arc::new(ManualClock::new(at(10, 0))),
                repository,
            }
        }

        fn collector(&self, source: &Arc<ScriptedSource>, page_size: u32) -> Collector {
            let repository = self
                .store
                .read(|conn| ops::get_repository(conn, &self.repository.id))
                .unwrap()
                .unwrap();
            Collector::new(
                self.store.clone(),
                source.clone(),
                self.clock.clone(),
                repository,
                page_size,
            )
        }

        fn id(&self) -> &RepositoryId {
            &self.repository.id
        }
    }

    type CommitRow = (String, DateTime<Utc>, u32, u32, Option<String>);
    type PullRequestRow = (u64, PrState, Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<String>);
    type ReviewRow = (String, ReviewState, DateTime<Utc>, Option<String>);

    /// Stored rows with user ids replaced by logins (or emails), so stores compare.
    fn rows(store: &Store, id: &RepositoryId) -> (Vec<CommitRow>, Vec<PullRequestRow>, Vec<ReviewRow>) {
        store
            .read(|conn| {
                let scope = ActivityScope::Repository(id.clone());
                let (start, end) = (at(1, 0) - Duration::days(30), at(10, 0));
                let who = |user: &Option<shipr_core::models::user::UserId>| -> anyhow::Result<Option<String>> {
                    Ok(match user {
                        Some(user) => ops::get_user(conn, user)?.and_then(|u| u.login.or(u.email)),
                        None => None,
                    })
                };

                let mut commits = Vec::new();
                for c in ops::commits_in_range(conn, &scope, &start, &end)? {
                    commits.push((c.sha, c.committed_at, c.additions, c.deletions, who(&c.author_id)?));
                }
                let mut pulls = Vec::new();
                for p in ops::pull_requests_in_range(conn, &scope, &start, &end)? {
                    pulls.push((p.number, p.state, p.merged_at, p.closed_at, who(&p.author_id)?));
                }
                let mut reviews = Vec::new();
                for r in ops::reviews_on_pull_requests_in_range(conn, &scope, &start, &end)? {
                    reviews.push((r.remote_id, r.state, r.submitted_at, who(&r.reviewer_id)?));
                }
                Ok((commits, pulls, reviews))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_bulk_collection() {
        let h = Harness::new();
        let source = Arc::new(activity());
        let collector = h.collector(&source, 100);

        let stats = collector.sync_all().await.unwrap();
        assert_eq!(collector.strategy().await, Strategy::Bulk);
        assert_eq!(stats.commit_count, 5);
        assert_eq!(stats.pull_request_count, 3);
        assert_eq!(stats.review_count, 3);

        let (commits, pulls, reviews) = rows(&h.store, h.id());
        assert_eq!(commits[0], ("a1".to_string(), at(1, 8), 12, 3, Some("ada".to_string())));
        assert_eq!(commits[2].4.as_deref(), Some("eve@example.com"));
        assert_eq!(commits[4].4, None);
        assert_eq!(pulls[0].1, PrState::Merged);
        assert_eq!(pulls[1].1, PrState::Closed);
        assert_eq!(reviews.len(), 3);
        assert_eq!(h.store.read(ops::count_users).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_per_item_matches_bulk() {
        let bulk = Harness::new();
        let bulk_source = Arc::new(activity());
        bulk.collector(&bulk_source, 100).sync_all().await.unwrap();

        let per_item = Harness::new();
        let per_item_source = Arc::new(activity().without_bulk());
        let collector = per_item.collector(&per_item_source, 100);
        let stats = collector.sync_all().await.unwrap();

        assert_eq!(collector.strategy().await, Strategy::PerItem);
        assert_eq!(stats.commit_count, 5);
        assert_eq!(stats.review_count, 3);
        // Listings carry no line stats, so each new commit costs a detail fetch.
        assert_eq!(per_item_source.detail_calls(), 5);
        assert_eq!(rows(&bulk.store, bulk.id()), rows(&per_item.store, per_item.id()));
    }

    #[tokio::test]
    async fn test_failing_bulk_falls_back() {
        let reference = Harness::new();
        reference
            .collector(&Arc::new(activity()), 100)
            .sync_all()
            .await
            .unwrap();

        let h = Harness::new();
        let source = Arc::new(activity().failing_bulk());
        let collector = h.collector(&source, 100);
        let stats = collector.sync_all().await.unwrap();

        assert_eq!(collector.strategy().await, Strategy::PerItem);
        assert_eq!(stats.commit_count, 5);
        assert_eq!(stats.pull_request_count, 3);
        assert_eq!(rows(&reference.store, reference.id()), rows(&h.store, h.id()));
    }

    #[tokio::test]
    async fn test_pages_follow_cursor() {
        let h = Harness::new();
        let source = Arc::new(activity());
        let collector = h.collector(&source, 2);

        assert_eq!(collector.collect_commits().await.unwrap(), 5);
        assert_eq!(source.calls(), 3);
        let pulls = collector.collect_pull_requests_and_reviews().await.unwrap();
        assert_eq!(pulls, PullRequestCounts { pull_requests: 3, reviews: 3 });
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn test_bulk_lists_reviews_past_the_embedded_ones() {
        let reference = Harness::new();
        reference
            .collector(&Arc::new(activity().without_bulk()), 100)
            .sync_all()
            .await
            .unwrap();

        let h = Harness::new();
        let source = Arc::new(activity().embedding_reviews_up_to(1));
        let collector = h.collector(&source, 100);
        let stats = collector.sync_all().await.unwrap();

        assert_eq!(collector.strategy().await, Strategy::Bulk);
        assert_eq!(stats.review_count, 3);
        // Only #1 has more reviews than were embedded.
        assert_eq!(source.calls(), 3);
        assert_eq!(rows(&reference.store, reference.id()), rows(&h.store, h.id()));
    }

    #[tokio::test]
    async fn test_tally_survives_a_failed_attempt() {
        let h = Harness::new();
        let tally = Arc::new(Mutex::new(CollectionStats::default()));
        let source = Arc::new(activity().throttling_pull_request_pages(1));

        let first = h.collector(&source, 100).with_tally(tally.clone());
        assert!(first.sync_all().await.unwrap_err().is_rate_limited());
        assert_eq!(first.tally().commit_count, 5);
        assert_eq!(first.tally().pull_request_count, 0);

        let retry = h.collector(&source, 100).with_tally(tally.clone());
        let stats = retry.sync_all().await.unwrap();
        assert_eq!(stats.commit_count, 0);
        assert_eq!(stats.pull_request_count, 3);
        assert_eq!(
            *tally.lock().unwrap(),
            CollectionStats {
                commit_count: 5,
                pull_request_count: 3,
                review_count: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_items_are_skipped() {
        let h = Harness::new();
        let source = Arc::new(activity().with_malformed_commits(2));
        assert_eq!(h.collector(&source, 100).collect_commits().await.unwrap(), 5);

        let h = Harness::new();
        let source = Arc::new(activity().with_malformed_commits(2).without_bulk());
        assert_eq!(h.collector(&source, 100).collect_commits().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_rerun_writes_nothing_new() {
        let h = Harness::new();
        let source = Arc::new(activity().without_bulk());
        let collector = h.collector(&source, 100);
        collector.sync_all().await.unwrap();
        let detail_calls = source.detail_calls();

        // Same collector, same (full) window: everything already stored.
        let again = collector.sync_all().await.unwrap();
        assert_eq!(again, CollectionStats::default());
        assert_eq!(source.detail_calls(), detail_calls);
        assert_eq!(h.store.read(|c| ops::count_commits(c, h.id())).unwrap(), 5);
        assert_eq!(h.store.read(|c| ops::count_reviews(c, h.id())).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pull_request_lifecycle_is_reconciled() {
        let h = Harness::new();
        let source = Arc::new(activity());
        let collector = h.collector(&source, 100);
        collector.sync_all().await.unwrap();

        source.upsert_pull_request(
            ScriptedPullRequest::opened(3, at(4, 9))
                .by(ScriptedUser::account("bob", 2))
                .merged(at(6, 9)),
        );
        let counts = collector.collect_pull_requests_and_reviews().await.unwrap();
        assert_eq!(counts, PullRequestCounts { pull_requests: 1, reviews: 0 });

        let stored = h
            .store
            .read(|conn| ops::get_pull_request(conn, h.id(), 3))
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, PrState::Merged);
        assert_eq!(stored.merged_at, Some(at(6, 9)));
        // The review stored earlier stays attached.
        assert_eq!(h.store.read(|c| ops::count_reviews(c, h.id())).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_a_fallback() {
        let h = Harness::new();
        let source = Arc::new(activity().rate_limited(1));
        let collector = h.collector(&source, 100);

        let err = collector.sync_all().await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(collector.strategy().await, Strategy::Bulk);
        let stored = h
            .store
            .read(|conn| ops::get_repository(conn, h.id()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_sync_at, None);
    }

    #[tokio::test]
    async fn test_watermark_only_moves_forward() {
        let h = Harness::new();
        let collector = h.collector(&Arc::new(activity()), 100);
        assert_eq!(collector.since(), None);

        assert!(collector.update_last_sync_at().unwrap());
        h.clock.set(at(9, 0));
        assert!(!collector.update_last_sync_at().unwrap());

        let next = h.collector(&Arc::new(activity()), 100);
        assert_eq!(next.since(), Some(at(10, 0)));
    }
}
