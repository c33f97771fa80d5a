//! Command-line entry points.

use clap::Args;

use crate::{config::PipelineConfig, prelude::*};

pub mod run;
pub mod schema;
pub mod status;

/// Options for locating and overriding the pipeline configuration.
///
/// Values are applied in order: built-in defaults, then `--config`, then any
/// individual flags or environment variables.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOpts {
    /// Configuration file. TOML, or JSON if the name ends in `.json`.
    #[clap(short = 'c', long = "config", env = "SCAN_INGEST_CONFIG")]
    config_path: Option<PathBuf>,

    /// Directory scanned for incoming archives.
    #[clap(long, env = "SCAN_INGEST_WATCH_DIR")]
    watch_dir: Option<PathBuf>,

    /// Root for per-archive scratch workspaces.
    #[clap(long, env = "SCAN_INGEST_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Directory receiving searchable PDFs.
    #[clap(long, env = "SCAN_INGEST_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// YAML file recording the last outcome for each archive.
    #[clap(long, env = "SCAN_INGEST_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// OCR engine: `tesseract`, or `none` for image-only PDFs.
    #[clap(long, env = "SCAN_INGEST_ENGINE")]
    engine: Option<String>,

    /// OCR language profile, such as `jpn` or `jpn+eng`.
    #[clap(long, env = "SCAN_INGEST_LANGUAGE")]
    language: Option<String>,

    /// Give up on a single page image after this many seconds.
    #[clap(long, env = "SCAN_INGEST_OCR_TIMEOUT")]
    ocr_timeout_secs: Option<u64>,

    /// Resolution to assume for images that don't declare one.
    #[clap(long, env = "SCAN_INGEST_FALLBACK_DPI")]
    fallback_dpi: Option<f32>,

    /// Also write a PNG copy of each page image.
    #[clap(long, env = "SCAN_INGEST_PNG_PREVIEWS")]
    png_previews: bool,

    /// Put outputs under `YYYY/MM/DD/` subdirectories of the output directory.
    #[clap(long, env = "SCAN_INGEST_DATE_PARTITIONED_OUTPUT")]
    date_partitioned_output: bool,
}

impl ConfigOpts {
    /// Build the effective configuration.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config_path {
            Some(path) => PipelineConfig::from_path(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(dir) = &self.watch_dir {
            config.watch_dir = dir.clone();
        }
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(path) = &self.status_file {
            config.status_file = path.clone();
        }
        if let Some(engine) = &self.engine {
            config.ocr.engine = engine.clone();
        }
        if let Some(language) = &self.language {
            config.ocr.language = language.clone();
        }
        if let Some(timeout_secs) = self.ocr_timeout_secs {
            config.ocr.timeout_secs = timeout_secs;
        }
        if let Some(fallback_dpi) = self.fallback_dpi {
            config.fallback_dpi = fallback_dpi;
        }
        if self.png_previews {
            config.png_previews = true;
        }
        if self.date_partitioned_output {
            config.date_partitioned_output = true;
        }
        config.validate()?;
        Ok(config)
    }
}
