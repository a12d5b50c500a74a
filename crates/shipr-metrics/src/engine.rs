use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::Connection;

use shipr_core::config::{Environment, ShiprConfig};
use shipr_core::error::ShiprError;
use shipr_core::models::metrics::{DailyBucket, MetricsEntity, MetricsMode, MetricsPayload};
use shipr_core::models::repository::TenantId;
use shipr_core::Clock;
use shipr_db::ops::{self, ActivityScope};
use shipr_db::Store;
use shipr_pool::{PoolConfig, Task, TaskFailure, TaskPool};

use crate::aggregate::{self, Activity};
use crate::cache::{CacheKey, MetricsCache};
use crate::synthetic;

/// One entry of a [`MetricsEngine::metrics_many`] batch.
#[derive(Debug, Clone)]
pub struct MetricsRequest {
    pub entity: MetricsEntity,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Where the rows for a request come from.
enum Target {
    Stored(ActivityScope),
    /// A repository that exists but has never been collected.
    NeverSynced(ActivityScope),
    Unknown(ShiprError),
}

pub struct MetricsEngine {
    store: Arc<Store>,
    cache: MetricsCache,
    environment: Environment,
    pool: PoolConfig,
}

impl MetricsEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: &ShiprConfig) -> Self {
        Self {
            store,
            cache: MetricsCache::new(clock, config.metrics.cache_ttl()),
            environment: config.metrics.environment,
            pool: PoolConfig::from_settings(&config.pool),
        }
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    /// Metrics for `entity` over the dates `start..=end`, served from cache
    /// while a previous identical request is still fresh.
    pub fn metrics_for(
        &self,
        tenant: &TenantId,
        entity: &MetricsEntity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MetricsPayload, ShiprError> {
        check_range(start, end)?;
        let key = CacheKey {
            tenant: tenant.to_string(),
            kind: entity.kind(),
            id: entity.id_string(),
            start,
            end,
        };
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!("metrics cache hit for {} {}", key.kind, key.id);
            return Ok(hit);
        }

        let payload = self.compute(tenant, entity, start, end)?;
        self.cache.insert(key, payload.clone());
        Ok(payload)
    }

    /// Like [`metrics_for`](Self::metrics_for) but never touches the cache.
    pub fn compute(
        &self,
        tenant: &TenantId,
        entity: &MetricsEntity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MetricsPayload, ShiprError> {
        check_range(start, end)?;
        let synthetic_allowed = self.environment.allows_synthetic_data();

        let scope = match self.store.read(|conn| target(conn, tenant, entity))? {
            Target::Stored(scope) => scope,
            Target::NeverSynced(scope) if !synthetic_allowed => scope,
            Target::NeverSynced(_) => {
                tracing::debug!("{} {} never synced, serving synthetic data", entity.kind(), entity.id_string());
                return Ok(self.synthetic(tenant, entity, start, end));
            }
            Target::Unknown(err) if synthetic_allowed => {
                tracing::debug!("{err}, serving synthetic data");
                return Ok(self.synthetic(tenant, entity, start, end));
            }
            Target::Unknown(err) => return Err(err),
        };

        let activity = self
            .store
            .read(|conn| load_activity(conn, &scope, start, end))?;
        let daily = aggregate::fold(start, end, &activity);
        Ok(payload(tenant, entity, start, end, MetricsMode::Live, daily))
    }

    fn synthetic(
        &self,
        tenant: &TenantId,
        entity: &MetricsEntity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsPayload {
        let activity = synthetic::generate(entity.kind(), &entity.id_string(), start, end);
        let daily = aggregate::fold(start, end, &activity);
        payload(tenant, entity, start, end, MetricsMode::Synthetic, daily)
    }

    /// Run many requests through the task pool. Results line up with `requests`.
    pub async fn metrics_many(
        self: &Arc<Self>,
        tenant: &TenantId,
        requests: Vec<MetricsRequest>,
    ) -> Vec<Result<MetricsPayload, ShiprError>> {
        let mut pool = TaskPool::new(self.pool.clone());
        pool.submit_many(
            requests
                .into_iter()
                .map(|request| Task::new("metrics", request)),
        );

        let engine = self.clone();
        let tenant = tenant.clone();
        pool.run_all(move |request: MetricsRequest| {
            let engine = engine.clone();
            let tenant = tenant.clone();
            async move { engine.metrics_for(&tenant, &request.entity, request.start, request.end) }
        })
        .await
        .into_iter()
        .map(|result| match result.outcome {
            Ok(payload) => Ok(payload),
            Err(TaskFailure::Failed(err)) => Err(err),
            Err(other) => Err(ShiprError::Other(other.to_string())),
        })
        .collect()
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<(), ShiprError> {
    if start > end {
        return Err(ShiprError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(())
}

fn target(conn: &Connection, tenant: &TenantId, entity: &MetricsEntity) -> anyhow::Result<Target> {
    Ok(match entity {
        MetricsEntity::Repository(id) => match ops::get_repository(conn, id)? {
            Some(repo) if repo.tenant_id == *tenant => {
                let scope = ActivityScope::Repository(id.clone());
                if repo.last_sync_at.is_none() {
                    Target::NeverSynced(scope)
                } else {
                    Target::Stored(scope)
                }
            }
            _ => Target::Unknown(ShiprError::RepositoryNotFound {
                name: id.to_string(),
            }),
        },
        MetricsEntity::User(id) => match ops::get_user(conn, id)? {
            Some(_) => Target::Stored(ActivityScope::User(tenant.clone(), id.clone())),
            None => Target::Unknown(ShiprError::UserNotFound { id: id.to_string() }),
        },
        MetricsEntity::Team(id) => match ops::get_team(conn, id)? {
            Some(team) if team.tenant_id == *tenant => {
                Target::Stored(ActivityScope::Team(tenant.clone(), id.clone()))
            }
            _ => Target::Unknown(ShiprError::TeamNotFound {
                name: id.to_string(),
            }),
        },
    })
}

fn load_activity(
    conn: &Connection,
    scope: &ActivityScope,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Activity> {
    let (from, until) = aggregate::instant_range(start, end);
    Ok(Activity {
        commits: ops::commits_in_range(conn, scope, &from, &until)?,
        pull_requests: ops::pull_requests_in_range(conn, scope, &from, &until)?,
        reviews: ops::reviews_given_in_range(conn, scope, &from, &until)?,
        pull_request_reviews: ops::reviews_on_pull_requests_in_range(conn, scope, &from, &until)?,
    })
}

fn payload(
    tenant: &TenantId,
    entity: &MetricsEntity,
    start: NaiveDate,
    end: NaiveDate,
    mode: MetricsMode,
    daily: Vec<DailyBucket>,
) -> MetricsPayload {
    MetricsPayload {
        entity_kind: entity.kind(),
        entity_id: entity.id_string(),
        tenant_id: tenant.to_string(),
        start_date: start,
        end_date: end,
        mode,
        summary: aggregate::summarize(&daily),
        dora: aggregate::derive(&daily),
        daily,
    }
}
