//! The `run` subcommand.

use clap::Args;

use super::ConfigOpts;
use crate::{pipeline::Pipeline, prelude::*, ui::Ui};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    #[clap(flatten)]
    pub config: ConfigOpts,

    /// What portion of archives should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,

    /// Don't show progress bars.
    #[clap(long)]
    pub no_progress: bool,
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let config = opts.config.pipeline_config()?;
    if opts.no_progress {
        ui.hide_progress_bars();
    }

    let status_file = config.status_file.clone();
    let pipeline = Pipeline::new(config, ui.clone());
    let summary = pipeline.run().await?;

    if summary.attempted == 0 {
        ui.display_message("📭", "No archives to process");
        return Ok(());
    }
    ui.display_message(
        "✅",
        &format!(
            "{} of {} archive(s) succeeded",
            summary.succeeded, summary.attempted
        ),
    );
    if summary.failed > 0 {
        ui.display_message(
            "❌",
            &format!(
                "{} archive(s) failed; see {}",
                summary.failed,
                status_file.display()
            ),
        );
    }
    summary.check_failure_rate(opts.allowed_failure_rate)
}
