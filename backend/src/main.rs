use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use opsnav_backend::config::{self, Config};
use opsnav_backend::serve;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending migrations and start the HTTP server (default).
    Serve,
    /// Run pending migrations only, then exit.
    Migrate,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(|e| {
        tracing::error!("failed to load config: {e}");
        e
    })?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!("starting opsnav-backend");
            serve::main(config)?;
        }
        Commands::Migrate => {
            tracing::info!("running migrations only");
            let pool = config::build_pool(&config.database_url, config.db_pool_size)?;
            config::run_migrations(&pool)?;
            tracing::info!("migrations complete");
        }
    }

    Ok(())
}
