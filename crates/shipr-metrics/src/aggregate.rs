//! Folding activity rows into day buckets, and the figures derived from them.

use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveDate, Utc};

use shipr_core::models::activity::{Commit, PullRequest, PullRequestId, Review};
use shipr_core::models::metrics::{DailyBucket, DoraMetrics, MetricsSummary};

/// Rows feeding one metrics computation.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    pub commits: Vec<Commit>,
    pub pull_requests: Vec<PullRequest>,
    /// Reviews counted as review activity on their submission day.
    pub reviews: Vec<Review>,
    /// Every review on `pull_requests`, used for time to first review.
    pub pull_request_reviews: Vec<Review>,
}

/// Half-open instant range covering the dates `start..=end`.
pub fn instant_range(start: NaiveDate, end: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.checked_add_days(Days::new(1)).unwrap_or(end);
    (
        start.and_time(chrono::NaiveTime::MIN).and_utc(),
        end.and_time(chrono::NaiveTime::MIN).and_utc(),
    )
}

/// Zero-filled buckets, one per day.
struct Buckets {
    start: NaiveDate,
    days: Vec<DailyBucket>,
}

impl Buckets {
    fn new(start: NaiveDate, end: NaiveDate) -> Self {
        let days = start
            .iter_days()
            .take_while(|d| *d <= end)
            .map(DailyBucket::empty)
            .collect();
        Self { start, days }
    }

    fn at(&mut self, instant: DateTime<Utc>) -> Option<&mut DailyBucket> {
        let offset = (instant.date_naive() - self.start).num_days();
        let index = usize::try_from(offset).ok()?;
        self.days.get_mut(index)
    }
}

/// Fold rows into one bucket per day of `start..=end`. Rows outside the range
/// are ignored; latencies that are not positive are left out.
pub fn fold(start: NaiveDate, end: NaiveDate, activity: &Activity) -> Vec<DailyBucket> {
    let mut buckets = Buckets::new(start, end);

    for commit in &activity.commits {
        if let Some(day) = buckets.at(commit.committed_at) {
            day.commits += 1;
            day.additions += u64::from(commit.additions);
            day.deletions += u64::from(commit.deletions);
        }
    }

    let mut first_review: HashMap<&PullRequestId, DateTime<Utc>> = HashMap::new();
    for review in &activity.pull_request_reviews {
        first_review
            .entry(&review.pull_request_id)
            .and_modify(|first| *first = (*first).min(review.submitted_at))
            .or_insert(review.submitted_at);
    }

    for pr in &activity.pull_requests {
        if let Some(day) = buckets.at(pr.created_at) {
            day.prs_opened += 1;
            if let Some(reviewed) = first_review.get(&pr.id) {
                let waited = (*reviewed - pr.created_at).num_milliseconds();
                if waited > 0 {
                    day.first_review_total_ms += waited;
                    day.first_review_samples += 1;
                }
            }
        }

        match (pr.merged_at, pr.closed_at) {
            (Some(merged), _) => {
                if let Some(day) = buckets.at(merged) {
                    day.prs_merged += 1;
                    let took = (merged - pr.created_at).num_milliseconds();
                    if took > 0 {
                        day.merge_time_total_ms += took;
                        day.merge_samples += 1;
                    }
                }
            }
            (None, Some(closed)) => {
                if let Some(day) = buckets.at(closed) {
                    day.prs_closed += 1;
                }
            }
            (None, None) => {}
        }
    }

    for review in &activity.reviews {
        if let Some(day) = buckets.at(review.submitted_at) {
            day.reviews += 1;
        }
    }

    buckets.days
}

pub fn summarize(daily: &[DailyBucket]) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    for day in daily {
        summary.total_commits += u64::from(day.commits);
        summary.total_additions += day.additions;
        summary.total_deletions += day.deletions;
        summary.total_prs_opened += u64::from(day.prs_opened);
        summary.total_prs_merged += u64::from(day.prs_merged);
        summary.total_prs_closed += u64::from(day.prs_closed);
        summary.total_reviews += u64::from(day.reviews);
        let active = day.commits > 0
            || day.prs_opened > 0
            || day.prs_merged > 0
            || day.prs_closed > 0
            || day.reviews > 0;
        if active {
            summary.active_days += 1;
        }
    }
    summary
}

/// Delivery figures from the bucket totals.
pub fn derive(daily: &[DailyBucket]) -> DoraMetrics {
    let mut merged = 0u64;
    let mut abandoned = 0u64;
    let (mut merge_ms, mut merge_samples) = (0i64, 0u64);
    let (mut review_ms, mut review_samples) = (0i64, 0u64);
    for day in daily {
        merged += u64::from(day.prs_merged);
        abandoned += u64::from(day.prs_closed);
        merge_ms += day.merge_time_total_ms;
        merge_samples += u64::from(day.merge_samples);
        review_ms += day.first_review_total_ms;
        review_samples += u64::from(day.first_review_samples);
    }

    let mean = |total: i64, samples: u64| {
        if samples == 0 {
            0.0
        } else {
            total as f64 / samples as f64
        }
    };
    let closed = merged + abandoned;
    let merge_mean_ms = mean(merge_ms, merge_samples);

    DoraMetrics {
        deployment_frequency: if daily.is_empty() {
            0.0
        } else {
            merged as f64 / daily.len() as f64
        },
        change_failure_rate: if closed == 0 {
            0.0
        } else {
            abandoned as f64 / closed as f64
        },
        avg_time_to_first_review_minutes: mean(review_ms, review_samples) / 60_000.0,
        avg_time_to_merge_minutes: merge_mean_ms / 60_000.0,
        pr_cycle_time_ms: merge_mean_ms,
    }
}
