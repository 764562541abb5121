use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jsonstore::db::{default_config_path, BackendKind, Store, StoreConfig, SCHEMA_VERSION};

/// Multi-tenant JSON object store: connect, verify the schema version, and
/// optionally migrate.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the store configuration file
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Apply pending schema migrations
    #[arg(long = "migrate")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(default_config_path);
    let mut config = match StoreConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            eprintln!(
                "Write a config file at {} or pass one with --config.",
                default_config_path().display()
            );
            std::process::exit(1);
        }
    };
    if cli.migrate {
        config.migrate = true;
    }

    // Resolve password: config file, then PGPASSWORD env var, then
    // interactive prompt.
    if config.backend == BackendKind::Postgres && config.postgres.password.is_empty() {
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            config.postgres.password = pw;
        } else {
            let prompt = format!("Password for {}: ", config.postgres.display_string());
            config.postgres.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    // Connecting runs the schema-version check; a version mismatch without
    // --migrate is fatal here, before the store serves anything.
    let store = Store::connect(&config).await?;
    info!(version = SCHEMA_VERSION, "store schema is up to date");
    store.close();

    Ok(())
}
