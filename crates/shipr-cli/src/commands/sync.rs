use std::sync::Arc;

use clap::Args;
use comfy_table::{Cell, Table};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use shipr_auth::KeyringStore;
use shipr_core::config::ShiprConfig;
use shipr_core::models::sync_state::{SyncProgress, SyncResult};
use shipr_core::SystemClock;
use shipr_host::github::GitHubSourceFactory;
use shipr_sync::{ProgressObserver, SyncEngine};

use super::history::status_cell;
use super::{find_repository, open_store, tenant_or_default};

/// Token used for repositories without one of their own.
const TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Args)]
pub struct SyncArgs {
    /// Repository full name (owner/repo) or id
    #[arg(required_unless_present = "all")]
    target: Option<String>,
    /// Sync every repository of the tenant
    #[arg(long, conflicts_with = "target")]
    all: bool,
    /// Ignore watermarks and refetch full history
    #[arg(long)]
    full: bool,
    /// Repositories collected at once (defaults to sync_concurrency)
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    tenant: Option<String>,
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.green} [{bar:30}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb
}

fn observer(pb: ProgressBar) -> ProgressObserver {
    Arc::new(move |progress: &SyncProgress| {
        pb.set_length(progress.total as u64);
        pb.set_position(progress.processed() as u64);
        let eta = progress
            .estimated_remaining_ms
            .map(|ms| format!(", ~{}s left", ms.div_ceil(1000)))
            .unwrap_or_default();
        pb.set_message(format!(
            "{} running, {} failed{eta}",
            progress.in_progress, progress.failed
        ));
    })
}

pub async fn run(args: SyncArgs) -> anyhow::Result<()> {
    let config = ShiprConfig::load()?;
    let store = open_store()?;
    let tenant = tenant_or_default(args.tenant, &config);

    let default_token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
    if default_token.is_none() {
        tracing::debug!("{TOKEN_ENV} not set; repositories without a stored token go anonymous");
    }
    let sources = GitHubSourceFactory::new(
        config.github_api_url.clone(),
        Arc::new(KeyringStore::new()),
        default_token,
    );
    let pb = progress_bar();
    let engine = SyncEngine::new(
        store.clone(),
        Arc::new(sources),
        Arc::new(SystemClock),
        &config,
    )
    .with_observer(observer(pb.clone()));

    let results = match args.target {
        Some(name) if !args.all => {
            let repo = find_repository(&store, &tenant, &name)?;
            pb.set_message(format!("syncing {}", repo.full_name));
            vec![engine.sync_one(&repo.id, args.full).await?]
        }
        _ => {
            let concurrency = args.concurrency.unwrap_or(config.sync_concurrency);
            engine.sync_all(&tenant, args.full, concurrency).await?
        }
    };
    pb.finish_and_clear();

    print_results(&results);
    Ok(())
}

fn print_results(results: &[SyncResult]) {
    let mut table = Table::new();
    table.set_header(vec!["REPOSITORY", "STATUS", "COMMITS", "PRS", "REVIEWS"]);
    for result in results {
        table.add_row(vec![
            Cell::new(&result.repository_name),
            status_cell(result),
            Cell::new(result.commit_count),
            Cell::new(result.pull_request_count),
            Cell::new(result.review_count),
        ]);
    }
    println!("{table}");

    let synced = results.iter().filter(|r| r.success).count();
    let skipped = results.iter().filter(|r| r.skipped).count();
    let failed = results.len() - synced - skipped;
    println!(
        "\nSync complete: {} synced | {} failed | {} skipped",
        style(synced).green(),
        if failed > 0 {
            style(failed).red().bold()
        } else {
            style(failed)
        },
        style(skipped).yellow()
    );

    for result in results.iter().filter(|r| !r.errors.is_empty()) {
        println!("\nErrors for {}:", style(&result.repository_name).bold());
        for err in &result.errors {
            println!("  {err}");
        }
    }
}
