pub mod config;
pub mod history;
pub mod metrics;
pub mod repo;
pub mod sync;
pub mod team;
pub mod user;

use std::sync::Arc;

use clap::Subcommand;
use shipr_core::config::ShiprConfig;
use shipr_core::models::repository::{Repository, TenantId};
use shipr_db::{ops, Store};

#[derive(Subcommand)]
pub enum Command {
    /// Initialize and manage shipr configuration
    Config {
        #[command(subcommand)]
        action: config::ConfigAction,
    },
    /// Manage tracked repositories
    Repo {
        #[command(subcommand)]
        action: repo::RepoAction,
    },
    /// Manage teams and their members
    Team {
        #[command(subcommand)]
        action: team::TeamAction,
    },
    /// Inspect resolved users
    User {
        #[command(subcommand)]
        action: user::UserAction,
    },
    /// Collect remote activity into the local store
    Sync(sync::SyncArgs),
    /// Show activity and delivery metrics
    Metrics(metrics::MetricsArgs),
    /// Show sync history
    History(history::HistoryArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Config { action } => config::run(action),
        Command::Repo { action } => repo::run(action),
        Command::Team { action } => team::run(action),
        Command::User { action } => user::run(action),
        Command::Sync(args) => sync::run(args).await,
        Command::Metrics(args) => metrics::run(args).await,
        Command::History(args) => history::run(args),
    }
}

/// Open the store at the configured location, creating it if needed.
pub(crate) fn open_store() -> anyhow::Result<Arc<Store>> {
    let home = ShiprConfig::home_dir()?;
    std::fs::create_dir_all(&home)?;
    Ok(Arc::new(Store::open(&ShiprConfig::db_path()?)?))
}

pub(crate) fn tenant_or_default(tenant: Option<String>, config: &ShiprConfig) -> TenantId {
    TenantId::new(tenant.unwrap_or_else(|| config.default_tenant.clone()))
}

/// Look a repository up by `owner/name` or by id.
pub(crate) fn find_repository(
    store: &Store,
    tenant: &TenantId,
    name: &str,
) -> anyhow::Result<Repository> {
    let found = store.read(|conn| {
        if let Some(repo) = ops::get_repository_by_full_name(conn, tenant, name)? {
            return Ok(Some(repo));
        }
        match name.parse() {
            Ok(id) => Ok(ops::get_repository(conn, &id)?.filter(|r| r.tenant_id == *tenant)),
            Err(_) => Ok(None),
        }
    })?;
    found.ok_or_else(|| anyhow::anyhow!("Repository '{}' not found in tenant {}", name, tenant))
}
