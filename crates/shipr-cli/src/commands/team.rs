use clap::Subcommand;
use comfy_table::Table;
use shipr_core::config::ShiprConfig;
use shipr_core::models::repository::TenantId;
use shipr_core::models::team::Team;
use shipr_core::models::user::User;
use shipr_db::{ops, Store};

use super::{open_store, tenant_or_default};

#[derive(Subcommand)]
pub enum TeamAction {
    /// Create a team
    Create {
        name: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// List teams
    List {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Add a user to a team, by login or email
    AddMember {
        team: String,
        user: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Remove a user from a team
    RemoveMember {
        team: String,
        user: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Show the members of a team
    Members {
        team: String,
        #[arg(long)]
        tenant: Option<String>,
    },
}

fn find_team(store: &Store, tenant: &TenantId, name: &str) -> anyhow::Result<Team> {
    store
        .read(|conn| ops::get_team_by_name(conn, tenant, name))?
        .ok_or_else(|| anyhow::anyhow!("Team '{}' not found in tenant {}", name, tenant))
}

/// Users are only known once a sync has seen them.
fn find_user(store: &Store, login_or_email: &str) -> anyhow::Result<User> {
    let needle = login_or_email.trim();
    store
        .read(|conn| {
            if needle.contains('@') {
                ops::find_user_by_email(conn, &needle.to_lowercase())
            } else {
                ops::find_user_by_login(conn, needle)
            }
        })?
        .ok_or_else(|| anyhow::anyhow!("No user '{}' seen yet; run `shipr sync` first", needle))
}

pub fn run(action: TeamAction) -> anyhow::Result<()> {
    let config = ShiprConfig::load()?;
    let store = open_store()?;

    match action {
        TeamAction::Create { name, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            if store.read(|conn| ops::get_team_by_name(conn, &tenant, &name))?.is_some() {
                anyhow::bail!("Team '{}' already exists in {}", name, tenant);
            }
            let team = Team::new(tenant.clone(), name);
            store.write(|tx| ops::insert_team(tx, &team))?;
            println!("Team '{}' created in {} ({})", team.name, tenant, team.id);
            Ok(())
        }
        TeamAction::List { tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let teams = store.read(|conn| ops::list_teams(conn, &tenant))?;
            if teams.is_empty() {
                println!("No teams in {tenant}. Use `shipr team create` to add one.");
                return Ok(());
            }

            let mut table = Table::new();
            table.set_header(vec!["TEAM", "MEMBERS", "ID"]);
            for team in &teams {
                let members = store.read(|conn| ops::list_team_members(conn, &team.id))?;
                table.add_row(vec![
                    team.name.clone(),
                    members.len().to_string(),
                    team.id.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        TeamAction::AddMember { team, user, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let team = find_team(&store, &tenant, &team)?;
            let user = find_user(&store, &user)?;
            store.write(|tx| ops::add_team_member(tx, &team.id, &user.id))?;
            println!("Added {} to {}", user.name, team.name);
            Ok(())
        }
        TeamAction::RemoveMember { team, user, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let team = find_team(&store, &tenant, &team)?;
            let user = find_user(&store, &user)?;
            store.write(|tx| ops::remove_team_member(tx, &team.id, &user.id))?;
            println!("Removed {} from {}", user.name, team.name);
            Ok(())
        }
        TeamAction::Members { team, tenant } => {
            let tenant = tenant_or_default(tenant, &config);
            let team = find_team(&store, &tenant, &team)?;
            let members = store.read(|conn| {
                let mut users = Vec::new();
                for id in ops::list_team_members(conn, &team.id)? {
                    if let Some(user) = ops::get_user(conn, &id)? {
                        users.push(user);
                    }
                }
                Ok(users)
            })?;

            if members.is_empty() {
                println!("Team '{}' has no members.", team.name);
                return Ok(());
            }
            println!("{:<24} {:<20} {}", "NAME", "LOGIN", "EMAIL");
            for user in &members {
                println!(
                    "{:<24} {:<20} {}",
                    user.name,
                    user.login.as_deref().unwrap_or("—"),
                    user.email.as_deref().unwrap_or("—")
                );
            }
            Ok(())
        }
    }
}
