use clap::Subcommand;
use comfy_table::Table;
use shipr_db::ops;

use super::open_store;

#[derive(Subcommand)]
pub enum UserAction {
    /// List every user resolved from synced activity
    List,
}

pub fn run(action: UserAction) -> anyhow::Result<()> {
    let store = open_store()?;

    match action {
        UserAction::List => {
            let users = store.read(ops::list_users)?;
            if users.is_empty() {
                println!("No users yet. They appear as `shipr sync` sees activity.");
                return Ok(());
            }

            let mut table = Table::new();
            table.set_header(vec!["NAME", "LOGIN", "EMAIL", "REMOTE ID", "ID"]);
            for user in &users {
                table.add_row(vec![
                    user.name.clone(),
                    user.login.clone().unwrap_or_default(),
                    user.email.clone().unwrap_or_default(),
                    user.remote_id.map(|id| id.to_string()).unwrap_or_default(),
                    user.id.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}
