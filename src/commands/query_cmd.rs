use clap::Args;
use serde_json::Value;

use mason_sync::{EmbeddedDb, LiveQueries, QueryObservers};

use super::OutputFormat;

/// Run a read-only query against the local replica
#[derive(Debug, Args)]
pub struct QueryCommand {
    /// SQL to run; columns are read with json_extract(row, '$.column')
    sql: String,

    /// Positional parameter; parsed as JSON, otherwise taken as a string
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl QueryCommand {
    pub async fn run(&self, db: EmbeddedDb) -> Result<(), Box<dyn std::error::Error>> {
        let params: Vec<Value> = self.params.iter().map(|p| parse_param(p)).collect();
        let queries = LiveQueries::new(db, QueryObservers::new());
        let rows = queries.query(&self.sql, &params).await?;

        match self.format {
            OutputFormat::Json => {
                let rows: Vec<Value> = rows.into_iter().map(Value::Object).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            OutputFormat::Text => {
                for row in &rows {
                    let line: Vec<String> = row
                        .iter()
                        .map(|(column, value)| format!("{}={}", column, value))
                        .collect();
                    println!("{}", line.join("  "));
                }
                println!("({} row{})", rows.len(), if rows.len() == 1 { "" } else { "s" });
            }
        }
        Ok(())
    }
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
