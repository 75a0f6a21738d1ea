use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, QueryCommand, ResetCommand, RunCommand, StatusCommand};
use mason_sync::config::Config;
use mason_sync::EmbeddedDb;

#[derive(Parser)]
#[command(name = "mason-sync")]
#[command(version)]
#[command(about = "Replicate Mason workspace data into a local database", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the workspace until interrupted
    Run(RunCommand),

    /// Show persisted sync state
    Status(StatusCommand),

    /// Query the local replica
    Query(QueryCommand),

    /// Forget sync cursors for the workspace
    Reset(ResetCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mason_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.clone())?;

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let db = EmbeddedDb::open(config.database_path.value.clone()).await?;
            let result = cmd.run(db.clone(), &config).await;
            db.close().await;
            result?;
        }
        Some(Commands::Status(cmd)) => {
            let db = EmbeddedDb::open(config.database_path.value.clone()).await?;
            cmd.run(db, &config).await?;
        }
        Some(Commands::Query(cmd)) => {
            let db = EmbeddedDb::open(config.database_path.value.clone()).await?;
            cmd.run(db).await?;
        }
        Some(Commands::Reset(cmd)) => {
            let db = EmbeddedDb::open(config.database_path.value.clone()).await?;
            cmd.run(db, &config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config, cli.config)?;
        }
        None => {
            println!("mason-sync - local-first replication for Mason");
            println!();
            println!("Run 'mason-sync --help' for usage information.");
        }
    }

    Ok(())
}
