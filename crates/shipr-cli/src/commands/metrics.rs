use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use clap::Args;
use comfy_table::Table;
use console::style;
use shipr_core::config::ShiprConfig;
use shipr_core::models::metrics::{EntityKind, MetricsEntity, MetricsMode, MetricsPayload};
use shipr_core::models::repository::TenantId;
use shipr_core::SystemClock;
use shipr_db::{ops, Store};
use shipr_metrics::{MetricsEngine, MetricsRequest};

use super::{open_store, tenant_or_default};

#[derive(Args)]
pub struct MetricsArgs {
    /// repository, user or team
    kind: EntityKind,
    /// Repository full name, user login or email, team name, or an id
    #[arg(required = true)]
    targets: Vec<String>,
    /// First day, inclusive (defaults to 29 days before --to)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day, inclusive (defaults to today, UTC)
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Print the raw payload as JSON
    #[arg(long)]
    json: bool,
    /// Include the per-day breakdown
    #[arg(long)]
    daily: bool,
    #[arg(long)]
    tenant: Option<String>,
}

/// Turn a name into a typed entity. Names the store does not know are tried as ids.
pub(crate) fn resolve_entity(
    store: &Store,
    tenant: &TenantId,
    kind: EntityKind,
    target: &str,
) -> anyhow::Result<MetricsEntity> {
    let found = store.read(|conn| {
        Ok(match kind {
            EntityKind::Repository => ops::get_repository_by_full_name(conn, tenant, target)?
                .map(|r| MetricsEntity::Repository(r.id)),
            EntityKind::Team => {
                ops::get_team_by_name(conn, tenant, target)?.map(|t| MetricsEntity::Team(t.id))
            }
            EntityKind::User if target.contains('@') => {
                ops::find_user_by_email(conn, &target.trim().to_lowercase())?
                    .map(|u| MetricsEntity::User(u.id))
            }
            EntityKind::User => {
                ops::find_user_by_login(conn, target)?.map(|u| MetricsEntity::User(u.id))
            }
        })
    })?;
    match found {
        Some(entity) => Ok(entity),
        None => MetricsEntity::parse(kind, target)
            .map_err(|_| anyhow::anyhow!("No {} named '{}' in tenant {}", kind, target, tenant)),
    }
}

fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
    let end = to.unwrap_or_else(|| Utc::now().date_naive());
    let start = from.unwrap_or_else(|| end.checked_sub_days(Days::new(29)).unwrap_or(end));
    (start, end)
}

pub async fn run(args: MetricsArgs) -> anyhow::Result<()> {
    let config = ShiprConfig::load()?;
    let store = open_store()?;
    let tenant = tenant_or_default(args.tenant, &config);
    let (start, end) = date_range(args.from, args.to);

    let entities = args
        .targets
        .iter()
        .map(|target| resolve_entity(&store, &tenant, args.kind, target))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let engine = Arc::new(MetricsEngine::new(store, Arc::new(SystemClock), &config));
    let payloads = if entities.len() == 1 {
        vec![engine.metrics_for(&tenant, &entities[0], start, end)?]
    } else {
        let requests = entities
            .into_iter()
            .map(|entity| MetricsRequest { entity, start, end })
            .collect();
        engine
            .metrics_many(&tenant, requests)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
    };

    if args.json {
        let json = if payloads.len() == 1 {
            serde_json::to_string_pretty(&payloads[0])?
        } else {
            serde_json::to_string_pretty(&payloads)?
        };
        println!("{json}");
        return Ok(());
    }

    for (target, payload) in args.targets.iter().zip(&payloads) {
        print_payload(target, payload, args.daily);
    }
    Ok(())
}

fn print_payload(target: &str, payload: &MetricsPayload, daily: bool) {
    let mode = match payload.mode {
        MetricsMode::Live => style("live").green(),
        MetricsMode::Synthetic => style("synthetic").yellow(),
    };
    println!(
        "{} {} ({} to {}, {})",
        payload.entity_kind,
        style(target).bold(),
        payload.start_date,
        payload.end_date,
        mode
    );

    let s = &payload.summary;
    let d = &payload.dora;
    println!("  Commits:              {} (+{} / -{})", s.total_commits, s.total_additions, s.total_deletions);
    println!(
        "  Pull requests:        {} opened, {} merged, {} closed",
        s.total_prs_opened, s.total_prs_merged, s.total_prs_closed
    );
    println!("  Reviews:              {}", s.total_reviews);
    println!("  Active days:          {} of {}", s.active_days, payload.daily.len());
    println!("  Deploys per day:      {:.2}", d.deployment_frequency);
    println!("  Change failure rate:  {:.1}%", d.change_failure_rate * 100.0);
    println!("  Time to first review: {:.0} min", d.avg_time_to_first_review_minutes);
    println!("  Time to merge:        {:.0} min", d.avg_time_to_merge_minutes);

    if daily {
        let mut table = Table::new();
        table.set_header(vec!["DATE", "COMMITS", "+", "-", "OPENED", "MERGED", "CLOSED", "REVIEWS"]);
        for day in &payload.daily {
            table.add_row(vec![
                day.date.to_string(),
                day.commits.to_string(),
                day.additions.to_string(),
                day.deletions.to_string(),
                day.prs_opened.to_string(),
                day.prs_merged.to_string(),
                day.prs_closed.to_string(),
                day.reviews.to_string(),
            ]);
        }
        println!("{table}");
    }
    println!();
}
