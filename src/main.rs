//! Helix - main entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use helix::cli::{self, Cli};
use helix::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let default_filter = if cli.verbose { "helix=debug" } else { "helix=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::from_env()?;
    tracing::debug!(
        data_root = %config.instances.data_root.display(),
        backup_root = %config.instances.backup_root.display(),
        db_backend = %config.database.backend,
        "Configuration loaded"
    );

    cli::run(cli, config).await
}
