//! End-to-end tests across the library crates, plus a few runs of the binary.

use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use shipr_core::config::{Environment, ShiprConfig};
use shipr_core::models::metrics::{MetricsEntity, MetricsMode};
use shipr_core::models::repository::{Repository, TenantId};
use shipr_core::models::team::Team;
use shipr_core::models::user::UserId;
use shipr_core::ManualClock;
use shipr_db::{ops, Store};
use shipr_host::testing::{
    ScriptedCommit, ScriptedPullRequest, ScriptedReview, ScriptedSource, ScriptedSourceFactory,
    ScriptedUser,
};
use shipr_metrics::{MetricsEngine, MetricsRequest};
use shipr_sync::SyncEngine;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, day, hour, 0, 0).unwrap()
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
}

fn widgets() -> ScriptedSource {
    let ada = ScriptedUser::account("ada", 1);
    let bob = ScriptedUser::account("bob", 2);
    ScriptedSource::new()
        .with_commits([
            ScriptedCommit::new("c1", at(1, 10)).by(ada.clone()).lines(10, 2),
            ScriptedCommit::new("c2", at(2, 10)).by(bob.clone()).lines(5, 5),
            ScriptedCommit::new("c3", at(3, 10)).by(ada.clone()).lines(1, 0),
        ])
        .with_pull_requests([
            ScriptedPullRequest::opened(1, at(1, 9))
                .by(ada)
                .merged(at(1, 15))
                .review(ScriptedReview::approved(101, bob.clone(), at(1, 12))),
            ScriptedPullRequest::opened(2, at(2, 9)).by(bob),
        ])
}

fn user_id(store: &Store, login: &str) -> UserId {
    store
        .read(|conn| ops::find_user_by_login(conn, login))
        .unwrap()
        .unwrap()
        .id
}

#[tokio::test]
async fn test_sync_then_metrics_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("shipr.db")).unwrap());
    let clock = Arc::new(ManualClock::new(at(20, 0)));
    let tenant = TenantId::new("acme");
    let config = ShiprConfig::default();

    // 1. Track a repository
    let repo = Repository::new(
        tenant.clone(),
        "acme/widgets".to_string(),
        "https://github.com/acme/widgets.git".to_string(),
    );
    store.write(|tx| ops::insert_repository(tx, &repo)).unwrap();

    // 2. Sync it
    let factory = Arc::new(ScriptedSourceFactory::new());
    factory.insert("acme/widgets", widgets());
    let sync = SyncEngine::new(store.clone(), factory, clock.clone(), &config);
    let results = sync.sync_all(&tenant, false, 2).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].errors);
    assert_eq!(results[0].commit_count, 3);
    assert_eq!(sync.progress().completed, 1);

    let history = store
        .read(|conn| ops::list_sync_history(conn, Some(&repo.id), 10))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].pull_request_count, 2);

    // 3. Group one author into a team
    let ada = user_id(&store, "ada");
    let bob = user_id(&store, "bob");
    let team = Team::new(tenant.clone(), "platform".to_string());
    store
        .write(|tx| {
            ops::insert_team(tx, &team)?;
            ops::add_team_member(tx, &team.id, &ada)
        })
        .unwrap();

    // 4. Metrics for all three kinds of entity
    let metrics = MetricsEngine::new(store.clone(), clock.clone(), &config);

    let by_repo = metrics
        .metrics_for(&tenant, &MetricsEntity::Repository(repo.id.clone()), date(1), date(10))
        .unwrap();
    assert_eq!(by_repo.mode, MetricsMode::Live);
    assert_eq!(by_repo.daily.len(), 10);
    assert_eq!(by_repo.summary.total_commits, 3);
    assert_eq!(by_repo.summary.total_additions, 16);
    assert_eq!(by_repo.summary.total_prs_opened, 2);
    assert_eq!(by_repo.summary.total_prs_merged, 1);
    assert_eq!(by_repo.summary.total_reviews, 1);
    assert_eq!(by_repo.summary.active_days, 3);
    assert!((by_repo.dora.deployment_frequency - 0.1).abs() < 1e-12);
    assert_eq!(by_repo.dora.change_failure_rate, 0.0);
    assert_eq!(by_repo.dora.avg_time_to_merge_minutes, 360.0);
    assert_eq!(by_repo.dora.avg_time_to_first_review_minutes, 180.0);

    let by_team = metrics
        .metrics_for(&tenant, &MetricsEntity::Team(team.id.clone()), date(1), date(10))
        .unwrap();
    assert_eq!(by_team.summary.total_commits, 2);
    assert_eq!(by_team.summary.total_prs_opened, 1);
    assert_eq!(by_team.summary.total_reviews, 0);

    let by_bob = metrics
        .metrics_for(&tenant, &MetricsEntity::User(bob), date(1), date(10))
        .unwrap();
    assert_eq!(by_bob.summary.total_commits, 1);
    assert_eq!(by_bob.summary.total_reviews, 1);
    assert_eq!(by_bob.summary.active_days, 2);

    // 5. A second sync changes nothing
    clock.advance(Duration::hours(1));
    let again = sync.sync_one(&repo.id, false).await.unwrap();
    assert!(again.success);
    assert_eq!(again.commit_count, 0);
    metrics.cache().clear();
    let recomputed = metrics
        .metrics_for(&tenant, &MetricsEntity::Repository(repo.id.clone()), date(1), date(10))
        .unwrap();
    assert_eq!(recomputed, by_repo);
}

#[tokio::test]
async fn test_unknown_entities_by_environment() {
    let store = Arc::new(Store::open_memory().unwrap());
    let clock = Arc::new(ManualClock::new(at(20, 0)));
    let tenant = TenantId::new("acme");
    let stranger = MetricsEntity::User(UserId::new());

    let production = MetricsEngine::new(store.clone(), clock.clone(), &ShiprConfig::default());
    assert!(production
        .metrics_for(&tenant, &stranger, date(1), date(7))
        .is_err());

    let mut config = ShiprConfig::default();
    config.metrics.environment = Environment::Test;
    let test = Arc::new(MetricsEngine::new(store, clock, &config));
    let results = test
        .metrics_many(
            &tenant,
            vec![
                MetricsRequest {
                    entity: stranger.clone(),
                    start: date(1),
                    end: date(7),
                },
                MetricsRequest {
                    entity: stranger.clone(),
                    start: date(7),
                    end: date(1),
                },
            ],
        )
        .await;
    let synthetic = results[0].as_ref().unwrap();
    assert_eq!(synthetic.mode, MetricsMode::Synthetic);
    assert_eq!(synthetic.daily.len(), 7);
    assert!(results[1].is_err());
}

#[test]
fn test_auth_memory_store() {
    use shipr_auth::{CredentialStore, MemoryStore};

    let store = MemoryStore::new();
    assert_eq!(store.get("test").unwrap(), None);
    store.store("test", "token123").unwrap();
    assert_eq!(store.get("test").unwrap(), Some("token123".to_string()));
    assert_eq!(
        store.resolve(Some("missing"), Some("fallback")).unwrap(),
        Some("fallback".to_string())
    );
    store.delete("test").unwrap();
    assert_eq!(store.get("test").unwrap(), None);
}

fn shipr(home: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_shipr"))
        .args(args)
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_cli_tracks_repository_and_reports_metrics() {
    let home = tempfile::tempdir().unwrap();

    let init = shipr(home.path(), &["config", "init"]);
    assert!(init.status.success());
    assert!(home.path().join(".shipr").join("config.toml").exists());

    let add = shipr(home.path(), &["repo", "add", "acme/widgets", "--tenant", "acme"]);
    assert!(add.status.success(), "{}", String::from_utf8_lossy(&add.stderr));

    let duplicate = shipr(home.path(), &["repo", "add", "acme/widgets", "--tenant", "acme"]);
    assert!(!duplicate.status.success());

    let list = shipr(home.path(), &["repo", "list", "--tenant", "acme"]);
    assert!(String::from_utf8_lossy(&list.stdout).contains("acme/widgets"));

    // Never synced, production default: an all-zero live payload.
    let metrics = shipr(
        home.path(),
        &[
            "metrics", "repository", "acme/widgets", "--tenant", "acme", "--from", "2024-04-01",
            "--to", "2024-04-05", "--json",
        ],
    );
    assert!(metrics.status.success(), "{}", String::from_utf8_lossy(&metrics.stderr));
    let payload: serde_json::Value = serde_json::from_slice(&metrics.stdout).unwrap();
    assert_eq!(payload["mode"], "live");
    assert_eq!(payload["daily"].as_array().unwrap().len(), 5);
    assert_eq!(payload["summary"]["total_commits"], 0);

    let history = shipr(home.path(), &["history"]);
    assert!(String::from_utf8_lossy(&history.stdout).contains("No sync history"));
}
