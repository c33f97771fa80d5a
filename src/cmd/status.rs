//! The `status` subcommand.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use super::ConfigOpts;
use crate::{
    async_utils::io::create_writer,
    prelude::*,
    status::{ArchiveStatus, StatusRecord, StatusStore},
};

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    #[clap(flatten)]
    pub config: ConfigOpts,

    /// Only show archives whose last attempt failed.
    #[clap(long)]
    pub failed: bool,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let config = opts.config.pipeline_config()?;
    let records = StatusStore::new(config.status_file).load()?;

    let mut wtr = create_writer(None).await?;
    for (archive, record) in &records {
        if opts.failed && record.status != ArchiveStatus::Failed {
            continue;
        }
        wtr.write_all(format_line(archive, record).as_bytes())
            .await
            .context("failed to write status")?;
    }
    wtr.flush().await.context("failed to flush status")?;
    Ok(())
}

/// One tab-separated line per archive. Messages can span lines, so we fold
/// them.
fn format_line(archive: &str, record: &StatusRecord) -> String {
    let message = record.message.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "{}\t{}\t{}\t{}\t{}\n",
        archive,
        record.status,
        record.filename.as_deref().unwrap_or("-"),
        record.processed_at,
        message
    )
}
