use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::OutputFormat;
use mason_sync::config::{Config, DEFAULT_ELECTRIC_URL};

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "database_path: {}",
                            config.database_path.value.display()
                        );
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("electric_url: {}", config.electric_url.value);
                        println!("  source: {}", config.electric_url.source);
                        println!();

                        match &config.workspace_id {
                            Some(id) => {
                                println!("workspace_id: {}", id.value);
                                println!("  source: {}", id.source);
                            }
                            None => println!("workspace_id: (not set)"),
                        }
                        println!();

                        println!(
                            "api_key: {}",
                            if config.sync.api_key.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                        println!("tables: {}", describe_tables(config));
                    }
                }
                Ok(())
            }
            ConfigSubcommand::Init { force } => {
                let path = config_path.unwrap_or_else(Config::default_config_path);
                if path.exists() && !force {
                    return Err(format!(
                        "Config file already exists at {} (use --force to overwrite)",
                        path.display()
                    )
                    .into());
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, starter_config())?;
                println!("Wrote {}", path.display());
                Ok(())
            }
        }
    }
}

fn describe_tables(config: &Config) -> String {
    match config.catalog() {
        Ok(catalog) => catalog.names().collect::<Vec<_>>().join(", "),
        Err(e) => format!("invalid ({})", e),
    }
}

fn starter_config() -> String {
    format!(
        "# Mason sync configuration\n\
         database_path: {}\n\
         electric_url: {}\n\
         # workspace_id: 00000000-0000-0000-0000-000000000000\n\
         sync:\n  \
           request_timeout_secs: 60\n  \
           initial_backoff_ms: 500\n  \
           max_backoff_secs: 30\n  \
           apply_attempts: 3\n  \
           degrade_after_failures: 3\n  \
           probe_timeout_secs: 5\n  \
           tombstone_retention_secs: 86400\n",
        Config::default_data_dir().join("replica.db").display(),
        DEFAULT_ELECTRIC_URL
    )
}
