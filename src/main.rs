use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod errors;
mod hasher;
mod intake;
mod ocr;
mod pdf;
mod pipeline;
mod prelude;
mod raster;
mod status;
mod ui;

/// Turn zip archives of scanned TIFF pages into searchable PDFs.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - SCAN_INGEST_CONFIG (optional): Configuration file (TOML or JSON).
  - SCAN_INGEST_WATCH_DIR, SCAN_INGEST_SCRATCH_DIR, SCAN_INGEST_OUTPUT_DIR,
    SCAN_INGEST_STATUS_FILE, SCAN_INGEST_ENGINE, SCAN_INGEST_LANGUAGE,
    SCAN_INGEST_OCR_TIMEOUT, SCAN_INGEST_FALLBACK_DPI,
    SCAN_INGEST_PNG_PREVIEWS, SCAN_INGEST_DATE_PARTITIONED_OUTPUT (optional):
    Override individual configuration values.
  - RUST_LOG (optional): Log filter, such as `debug` or `scan_ingest=trace`.

  These variables may be set in a standard `.env` file.

  Do not run two batches against the same status file at once.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process every archive in the watch directory.
    Run(cmd::run::RunOpts),
    /// Show the last outcome recorded for each archive.
    Status(cmd::status::StatusOpts),
    /// Print schemas for the status and configuration files.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) => false,
            Cmd::Status(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Load environment variables from a `.env` file, if it exists. This must
    // happen before we read `RUST_LOG`.
    dotenvy::dotenv().ok();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            cmd::run::cmd_run(ui, run_opts).await?;
        }
        Cmd::Status(status_opts) => {
            cmd::status::cmd_status(status_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
