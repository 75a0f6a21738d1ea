use clap::ValueEnum;

mod config_cmd;
mod query_cmd;
mod reset_cmd;
mod run_cmd;
mod status_cmd;

pub use config_cmd::ConfigCommand;
pub use query_cmd::QueryCommand;
pub use reset_cmd::ResetCommand;
pub use run_cmd::RunCommand;
pub use status_cmd::StatusCommand;

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
