use clap::Subcommand;
use shipr_auth::{CredentialStore, KeyringStore};
use shipr_core::config::ShiprConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Initialize ~/.shipr/ directory with default config and database
    Init,
    /// Show current configuration
    Show,
    /// Store an access token in the OS keychain
    Token {
        /// Credential key, e.g. the one printed by `shipr repo add`
        key: String,
        /// API token (will prompt if not provided)
        #[arg(long)]
        token: Option<String>,
        /// Remove the stored token instead
        #[arg(long, conflicts_with = "token")]
        delete: bool,
    },
}

pub fn run(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let home = ShiprConfig::init()?;
            let db_path = ShiprConfig::db_path()?;

            // Ensure database is created with schema
            shipr_db::open_db(&db_path)?;

            println!("Initialized shipr at {}", home.display());
            println!("  config: {}", ShiprConfig::config_path()?.display());
            println!("  database: {}", db_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = ShiprConfig::load()?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
            Ok(())
        }
        ConfigAction::Token { key, token, delete } => {
            let cred_store = KeyringStore::new();
            if delete {
                cred_store.delete(&key)?;
                println!("Token '{key}' removed from OS keychain");
                return Ok(());
            }

            let token = match token {
                Some(t) => t,
                None => super::repo::prompt_token(&key)?,
            };
            if token.is_empty() {
                anyhow::bail!("Token cannot be empty");
            }

            cred_store.store(&key, &token)?;
            println!("Token stored in OS keychain as '{key}'");
            Ok(())
        }
    }
}
