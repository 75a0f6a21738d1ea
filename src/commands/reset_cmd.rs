use clap::Args;

use mason_sync::{CursorRepository, EmbeddedDb};

use mason_sync::config::Config;

/// Forget the workspace's sync cursors so the next run copies every table
#[derive(Debug, Args)]
pub struct ResetCommand {}

impl ResetCommand {
    pub async fn run(&self, db: EmbeddedDb, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let session = config.session_key();
        let cursors = CursorRepository::new(db);
        let removed = cursors.clear_session(&session).await?;
        cursors.save_session_status(&session, "stopped").await?;

        println!(
            "Cleared {} cursor{} for workspace {}",
            removed,
            if removed == 1 { "" } else { "s" },
            session
        );
        Ok(())
    }
}
