use clap::Subcommand;
use comfy_table::{Cell, Color, Table};
use shipr_auth::{credential_key, CredentialStore, KeyringStore};
use shipr_core::config::ShiprConfig;
use shipr_core::models::repository::Repository;
use shipr_db::ops;

use super::{find_repository, open_store, tenant_or_default};

#[derive(Subcommand)]
pub enum RepoAction {
    /// Start tracking a repository
    Add {
        /// Full name (owner/repo)
        full_name: String,
        /// Tenant owning the repository
        #[arg(long)]
        tenant: Option<String>,
        /// API base for self-hosted instances
        #[arg(long)]
        api_url: Option<url::Url>,
        /// Store a token for this repository in the OS keychain
        #[arg(long)]
        token: Option<String>,
        /// Prompt for a token instead of passing it on the command line
        #[arg(long, conflicts_with = "token")]
        prompt_token: bool,
    },
    /// List tracked repositories
    List {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Show details of a repository
    Info {
        /// Full name (owner/repo) or id
        name: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Forget the watermark so the next sync refetches everything
    Reset {
        name: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Stop tracking a repository and drop its activity
    Remove {
        name: String,
        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Read a token from stdin.
pub(crate) fn prompt_token(label: &str) -> anyhow::Result<String> {
    eprint!("Enter API token for {label}: ");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn run(action: RepoAction) -> anyhow::Result<()> {
    let config = ShiprConfig::load()?;
    let store = open_store()?;

    match action {
        RepoAction::Add {
            full_name,
            tenant,
            api_url,
            token,
            prompt_token: prompt,
        } => {
            let tenant = tenant_or_default(tenant, &config);
            let (owner, name) = full_name
                .split_once('/')
                .filter(|(o, n)| !o.is_empty() && !n.is_empty())
                .ok_or_else(|| anyhow::anyhow!("Expected owner/repo, got '{}'", full_name))?;

            if store.read(|conn| ops::get_repository_by_full_name(conn, &tenant, &full_name))?.is_some() {
                anyhow::bail!("Repository '{}' is already tracked in {}", full_name, tenant);
            }

            let web_base = api_url
                .as_ref()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "github.com".to_string());
            let mut repo = Repository::new(
                tenant.clone(),
                full_name.clone(),
                format!("https://{web_base}/{owner}/{name}.git"),
            );
            repo.api_url = api_url;

            let token = match token {
                Some(t) => Some(t),
                None if prompt => Some(prompt_token(&full_name)?),
                None => None,
            };
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                let key = credential_key(&full_name);
                KeyringStore::new().store(&key, &token)?;
                println!("Token stored in OS keychain as '{key}'");
                repo.credential_key = Some(key);
            }

            store.write(|tx| ops::insert_repository(tx, &repo))?;
            println!("Tracking {} in {} ({})", repo.full_name, tenant, repo.id);
            Ok(())
        }
        RepoAction::List { tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let repos = store.read(|conn| ops::list_repositories(conn, &tenant))?;

            if repos.is_empty() {
                println!("No repositories tracked. Use `shipr repo add` to track one.");
                return Ok(());
            }

            let mut table = Table::new();
            table.set_header(vec!["REPOSITORY", "COMMITS", "PRS", "REVIEWS", "LAST SYNC"]);
            for repo in &repos {
                let (commits, prs, reviews) = store.read(|conn| {
                    Ok((
                        ops::count_commits(conn, &repo.id)?,
                        ops::count_pull_requests(conn, &repo.id)?,
                        ops::count_reviews(conn, &repo.id)?,
                    ))
                })?;
                let last_sync = if repo.needs_full_sync() {
                    Cell::new("never").fg(Color::Yellow)
                } else {
                    Cell::new(repo.watermark().format("%Y-%m-%d %H:%M").to_string())
                };
                table.add_row(vec![
                    Cell::new(&repo.full_name),
                    Cell::new(commits),
                    Cell::new(prs),
                    Cell::new(reviews),
                    last_sync,
                ]);
            }
            println!("{table}");
            Ok(())
        }
        RepoAction::Info { name, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let repo = find_repository(&store, &tenant, &name)?;

            println!("Repository:     {}", repo.full_name);
            println!("Id:             {}", repo.id);
            println!("Tenant:         {}", repo.tenant_id);
            println!("Clone URL:      {}", repo.clone_url);
            println!(
                "API URL:        {}",
                repo.api_url
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| format!("{} (default)", config.github_api_url))
            );
            println!(
                "Credential key: {}",
                repo.credential_key.as_deref().unwrap_or("(none)")
            );
            match repo.last_sync_at {
                Some(ts) if !repo.needs_full_sync() => println!("Last sync:      {ts}"),
                _ => println!("Last sync:      never (next sync is a full one)"),
            }

            let (commits, prs, reviews) = store.read(|conn| {
                Ok((
                    ops::count_commits(conn, &repo.id)?,
                    ops::count_pull_requests(conn, &repo.id)?,
                    ops::count_reviews(conn, &repo.id)?,
                ))
            })?;
            println!("Commits:        {commits}");
            println!("Pull requests:  {prs}");
            println!("Reviews:        {reviews}");
            Ok(())
        }
        RepoAction::Reset { name, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let repo = find_repository(&store, &tenant, &name)?;
            store.write(|tx| ops::reset_watermark(tx, &repo.id))?;
            println!("Watermark for {} reset; next sync fetches full history", repo.full_name);
            Ok(())
        }
        RepoAction::Remove { name, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let repo = find_repository(&store, &tenant, &name)?;

            if let Some(key) = &repo.credential_key {
                let _ = KeyringStore::new().delete(key);
            }
            // Cascades to commits, pull requests and reviews
            store.write(|tx| ops::delete_repository(tx, &repo.id))?;

            println!("Repository '{}' removed", repo.full_name);
            Ok(())
        }
    }
}
