//! Pipeline configuration.
//!
//! Configuration is an explicit value handed to the orchestrator. It starts
//! from built-in defaults, may be replaced by a TOML or JSON file, and is then
//! adjusted by command-line flags (see [`crate::cmd::run::RunOpts`]).

use std::fs;

use schemars::JsonSchema;

use crate::prelude::*;

/// Everything the pipeline needs to know about where things live.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory scanned for incoming archives.
    pub watch_dir: PathBuf,

    /// Root under which each archive gets its own scratch workspace.
    pub scratch_dir: PathBuf,

    /// Directory receiving the searchable PDFs.
    pub output_dir: PathBuf,

    /// YAML file recording the outcome of the last attempt for each archive.
    pub status_file: PathBuf,

    /// Extension of archive files, without the dot. Matched case-insensitively.
    pub archive_extension: String,

    /// Extensions of page images inside archives. Matched case-insensitively.
    pub image_extensions: Vec<String>,

    /// Resolution assumed for images that don't declare one.
    pub fallback_dpi: f32,

    /// Also write a PNG copy of each page image next to its PDF.
    pub png_previews: bool,

    /// Put each batch's outputs under `output_dir/YYYY/MM/DD/`, using the
    /// local date the batch started.
    pub date_partitioned_output: bool,

    /// OCR engine settings.
    pub ocr: OcrConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from("images"),
            scratch_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("output"),
            status_file: PathBuf::from("status.yaml"),
            archive_extension: "zip".to_owned(),
            image_extensions: vec!["tif".to_owned()],
            fallback_dpi: 72.0,
            png_previews: false,
            date_partitioned_output: false,
            ocr: OcrConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML or JSON file.
    ///
    /// Files ending in `.json` are parsed as JSON. Everything else is TOML.
    /// Missing keys take their default values.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse JSON config {:?}", path))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("Failed to parse TOML config {:?}", path))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check for values that would make every archive fail.
    pub fn validate(&self) -> Result<()> {
        if self.archive_extension.is_empty() {
            return Err(anyhow!("archive_extension must not be empty"));
        }
        if self.image_extensions.is_empty() {
            return Err(anyhow!("image_extensions must list at least one extension"));
        }
        if !(self.fallback_dpi.is_finite() && self.fallback_dpi > 0.0) {
            return Err(anyhow!(
                "fallback_dpi must be a positive number, not {}",
                self.fallback_dpi
            ));
        }
        if self.ocr.timeout_secs == 0 {
            return Err(anyhow!("ocr.timeout_secs must be at least 1"));
        }
        Ok(())
    }

    /// Is this path an archive we should pick up?
    pub fn is_archive_path(&self, path: &Path) -> bool {
        extension_matches(path, std::slice::from_ref(&self.archive_extension))
    }

    /// Is this path a page image?
    pub fn is_page_image_path(&self, path: &Path) -> bool {
        extension_matches(path, &self.image_extensions)
    }
}

/// Does `path` have one of `extensions`, ignoring case and any leading dot?
fn extension_matches(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// OCR engine settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrConfig {
    /// Which engine to use: `tesseract`, or `none` for image-only output.
    pub engine: String,

    /// Recognition language profile passed to the engine.
    pub language: String,

    /// Give up on a single image after this many seconds.
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: "tesseract".to_owned(),
            language: "jpn".to_owned(),
            timeout_secs: 300,
        }
    }
}
