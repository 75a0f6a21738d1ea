use clap::Args;
use serde::Serialize;

use mason_sync::{CursorRepository, EmbeddedDb, ReplicaWriter, QueryObservers};

use super::OutputFormat;
use mason_sync::config::Config;

/// Show the persisted sync state of the configured workspace
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Serialize)]
struct TableReport {
    table: String,
    rows: Option<i64>,
    cursor: Option<String>,
    owner: Option<String>,
}

#[derive(Serialize)]
struct StatusReport {
    session: String,
    status: Option<String>,
    tables: Vec<TableReport>,
}

impl StatusCommand {
    pub async fn run(&self, db: EmbeddedDb, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let session = config.session_key();
        let catalog = config.catalog()?;
        let cursors = CursorRepository::new(db.clone());
        let writer = ReplicaWriter::new(db, QueryObservers::new());

        let mut tables = Vec::with_capacity(catalog.len());
        for table in catalog.tables() {
            let rows = writer.row_count(table).await.ok();
            let cursor = cursors
                .load_cursor(&session, &table.name)
                .await?
                .map(|c| c.to_string());
            let owner = cursors.table_owner(&table.name).await?;
            tables.push(TableReport {
                table: table.name.clone(),
                rows,
                cursor,
                owner,
            });
        }

        let report = StatusReport {
            status: cursors.load_session_status(&session).await?,
            session,
            tables,
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!("Session: {}", report.session);
                println!(
                    "Status:  {}",
                    report.status.as_deref().unwrap_or("never started")
                );
                println!();
                println!("{:<16} {:>8}  {:<24} {}", "TABLE", "ROWS", "CURSOR", "OWNER");
                for table in &report.tables {
                    let rows = table
                        .rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<16} {:>8}  {:<24} {}",
                        table.table,
                        rows,
                        table.cursor.as_deref().unwrap_or("-"),
                        table.owner.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Ok(())
    }
}
