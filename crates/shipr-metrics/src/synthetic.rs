//! Deterministic stand-in activity for entities with nothing stored yet.
//!
//! Only ever served outside production, and always marked as synthetic in the
//! payload. The same entity and range always produce the same rows.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use shipr_core::models::activity::{Commit, PrState, PullRequest, PullRequestId, Review, ReviewState};
use shipr_core::models::metrics::EntityKind;
use shipr_core::models::repository::RepositoryId;

use crate::aggregate::Activity;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over the parts, each followed by a zero byte.
pub fn fnv1a(parts: &[&str]) -> u64 {
    let mut hash = FNV_OFFSET;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

pub fn seed(kind: EntityKind, id: &str, start: NaiveDate, end: NaiveDate) -> u64 {
    fnv1a(&[
        &kind.to_string(),
        id,
        &start.to_string(),
        &end.to_string(),
    ])
}

fn instant(day: NaiveDate, minute_of_day: i64) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc() + Duration::minutes(minute_of_day)
}

/// Activity for `start..=end`, seeded from the request.
pub fn generate(kind: EntityKind, id: &str, start: NaiveDate, end: NaiveDate) -> Activity {
    let mut rng = StdRng::seed_from_u64(seed(kind, id, start, end));
    let repository_id = RepositoryId::from_uuid(Uuid::from_u128(rng.random()));
    let mut activity = Activity::default();

    for day in start.iter_days().take_while(|d| *d <= end) {
        for _ in 0..rng.random_range(0..=6u32) {
            activity.commits.push(Commit {
                sha: format!("{:040x}", rng.random::<u128>()),
                repository_id: repository_id.clone(),
                author_id: None,
                committer_id: None,
                message: "synthetic commit".to_string(),
                committed_at: instant(day, rng.random_range(0..1440)),
                additions: rng.random_range(1..400),
                deletions: rng.random_range(0..150),
            });
        }

        if !rng.random_bool(0.6) {
            continue;
        }
        for _ in 0..rng.random_range(1..=2u32) {
            let created_at = instant(day, rng.random_range(0..1440));
            let id = PullRequestId::from_uuid(Uuid::from_u128(rng.random()));

            if rng.random_bool(0.8) {
                let review = Review {
                    remote_id: format!("synthetic-{}", rng.random::<u64>()),
                    pull_request_id: id.clone(),
                    reviewer_id: None,
                    state: ReviewState::Approved,
                    submitted_at: created_at + Duration::minutes(rng.random_range(10..=1440)),
                };
                activity.reviews.push(review.clone());
                activity.pull_request_reviews.push(review);
            }

            let roll: f64 = rng.random();
            let (state, merged_at, closed_at) = if roll < 0.7 {
                let merged = created_at + Duration::minutes(rng.random_range(30..=4320));
                (PrState::Merged, Some(merged), Some(merged))
            } else if roll < 0.85 {
                let closed = created_at + Duration::minutes(rng.random_range(60..=2880));
                (PrState::Closed, None, Some(closed))
            } else {
                (PrState::Open, None, None)
            };

            activity.pull_requests.push(PullRequest {
                number: activity.pull_requests.len() as u64 + 1,
                id,
                repository_id: repository_id.clone(),
                title: "synthetic pull request".to_string(),
                author_id: None,
                state,
                created_at,
                updated_at: closed_at.unwrap_or(created_at),
                closed_at,
                merged_at,
                additions: rng.random_range(1..800),
                deletions: rng.random_range(0..300),
                changed_files: rng.random_range(1..30),
            });
        }
    }
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::fold;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    #[test]
    fn test_fnv1a_known_values() {
        // Empty input is the offset basis; one empty part hashes a single zero byte.
        assert_eq!(fnv1a(&[]), FNV_OFFSET);
        assert_eq!(fnv1a(&[""]), 0xaf63_bd4c_8601_b7df);
    }

    #[test]
    fn test_parts_are_separated() {
        assert_ne!(fnv1a(&["ab", "c"]), fnv1a(&["a", "bc"]));
    }

    #[test]
    fn test_same_request_same_activity() {
        let a = fold(
            date(1, 1),
            date(1, 31),
            &generate(EntityKind::User, "u-1", date(1, 1), date(1, 31)),
        );
        let b = fold(
            date(1, 1),
            date(1, 31),
            &generate(EntityKind::User, "u-1", date(1, 1), date(1, 31)),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_requests_differ() {
        let a = generate(EntityKind::User, "u-1", date(1, 1), date(3, 31));
        let b = generate(EntityKind::User, "u-2", date(1, 1), date(3, 31));
        let shas = |activity: &Activity| {
            activity.commits.iter().map(|c| c.sha.clone()).collect::<Vec<_>>()
        };
        assert_ne!(shas(&a), shas(&b));
    }

    #[test]
    fn test_rows_fall_inside_their_day() {
        let activity = generate(EntityKind::Team, "t", date(2, 1), date(2, 10));
        for commit in &activity.commits {
            let day = commit.committed_at.date_naive();
            assert!(day >= date(2, 1) && day <= date(2, 10));
        }
        for pr in &activity.pull_requests {
            if let Some(merged) = pr.merged_at {
                assert!(merged > pr.created_at);
            }
        }
    }
}
