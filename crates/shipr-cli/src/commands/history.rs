use clap::Args;
use comfy_table::{Cell, Color, Table};
use shipr_core::config::ShiprConfig;
use shipr_core::models::sync_state::SyncResult;
use shipr_db::ops;

use super::{find_repository, open_store, tenant_or_default};

#[derive(Args)]
pub struct HistoryArgs {
    /// Filter by repository full name or id
    repo: Option<String>,
    /// Number of records to show
    #[arg(long, default_value = "20")]
    limit: u32,
    #[arg(long)]
    tenant: Option<String>,
}

pub(crate) fn status_cell(result: &SyncResult) -> Cell {
    if result.success {
        Cell::new("synced").fg(Color::Green)
    } else if result.skipped {
        Cell::new("skipped").fg(Color::Yellow)
    } else {
        Cell::new("failed").fg(Color::Red)
    }
}

pub fn run(args: HistoryArgs) -> anyhow::Result<()> {
    let config = ShiprConfig::load()?;
    let store = open_store()?;

    let repo_id = match args.repo {
        Some(ref name) => {
            let tenant = tenant_or_default(args.tenant, &config);
            Some(find_repository(&store, &tenant, name)?.id)
        }
        None => None,
    };

    let records =
        store.read(|conn| ops::list_sync_history(conn, repo_id.as_ref(), args.limit))?;

    if records.is_empty() {
        println!("No sync history found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "STARTED",
        "REPOSITORY",
        "STATUS",
        "COMMITS",
        "PRS",
        "REVIEWS",
        "TOOK",
        "ERRORS",
    ]);
    for record in &records {
        let took = record.finished_at - record.started_at;
        let errors = if record.errors.is_empty() {
            "—".to_string()
        } else {
            format!("{} error(s)", record.errors.len())
        };
        table.add_row(vec![
            Cell::new(record.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&record.repository_name),
            status_cell(record),
            Cell::new(record.commit_count),
            Cell::new(record.pull_request_count),
            Cell::new(record.review_count),
            Cell::new(format!("{:.1}s", took.num_milliseconds() as f64 / 1000.0)),
            Cell::new(errors),
        ]);
    }
    println!("{table}");

    Ok(())
}
