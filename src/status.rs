//! Durable record of what happened to each archive.
//!
//! The status file is a YAML document like:
//!
//! ```yaml
//! processed_files:
//!   batch1.zip:
//!     status: succeeded
//!     message: processed 3 page image(s)
//!     processed_at: 2024-05-01 09:30:12
//!   batch2.zip:
//!     status: failed
//!     message: "OCR failed for ...: tesseract timed out after 300s"
//!     filename: page7.tif
//!     processed_at: 2024-05-01 09:31:40
//! ```
//!
//! There is at most one record per archive, and each attempt overwrites the
//! previous record. The file is only written once per batch.
//!
//! Running two batches against the same status file at the same time is not
//! supported: whichever finishes last wins, and the other batch's records are
//! lost.

use std::{collections::BTreeMap, fmt, fs, io::Write as _};

use chrono::Local;
use schemars::JsonSchema;

use crate::prelude::*;

/// Format used for [`StatusRecord::processed_at`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Did the last attempt on an archive work?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    /// Every page image was synthesized.
    Succeeded,
    /// Extraction or some page image failed.
    Failed,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveStatus::Succeeded => write!(f, "succeeded"),
            ArchiveStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The outcome of the most recent attempt to process one archive.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    /// Whether the attempt succeeded.
    pub status: ArchiveStatus,

    /// A human-readable summary, or the error message.
    pub message: String,

    /// The file that caused a failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Local time of the attempt, as `YYYY-MM-DD HH:MM:SS`.
    pub processed_at: String,
}

impl StatusRecord {
    /// A success record stamped with the current local time.
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            status: ArchiveStatus::Succeeded,
            message: message.into(),
            filename: None,
            processed_at: now_timestamp(),
        }
    }

    /// A failure record stamped with the current local time.
    pub fn failed(message: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            status: ArchiveStatus::Failed,
            message: message.into(),
            filename: Some(filename.into()),
            processed_at: now_timestamp(),
        }
    }
}

/// The current local time in [`TIMESTAMP_FORMAT`].
fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Archive name to status record.
pub type StatusMap = BTreeMap<String, StatusRecord>;

/// The on-disk document.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StatusFile {
    /// Records keyed by archive file name.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub processed_files: StatusMap,
}

/// Treat `processed_files:` with no value as an empty map.
fn null_as_empty<'de, D>(deserializer: D) -> Result<StatusMap, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<StatusMap>::deserialize(deserializer)?.unwrap_or_default())
}

/// Loads and saves the status file.
#[derive(Clone, Debug)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    /// Create a store backed by `path`. Nothing is read until [`Self::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records.
    ///
    /// A missing or empty file is an empty map. A file we can't read or parse
    /// is an error, because overwriting it would lose history.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<StatusMap> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No status file yet");
                return Ok(StatusMap::new());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read status file {:?}", self.path)
                });
            }
        };
        if data.trim().is_empty() {
            return Ok(StatusMap::new());
        }
        let file: Option<StatusFile> = serde_yaml::from_str(&data)
            .with_context(|| format!("Failed to parse status file {:?}", self.path))?;
        let records = file.unwrap_or_default().processed_files;
        debug!(count = records.len(), "Loaded status records");
        Ok(records)
    }

    /// Replace the file with `records`.
    ///
    /// We write a temporary file next to the target and rename it into place,
    /// so readers never see a half-written document.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub fn save(&self, records: &StatusMap) -> Result<()> {
        let document = StatusFile {
            processed_files: records.clone(),
        };
        let yaml =
            serde_yaml::to_string(&document).context("Failed to serialize status")?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {:?}", dir))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".status")
            .suffix(".yaml.tmp")
            .tempfile_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
        tmp.write_all(yaml.as_bytes())
            .context("Failed to write status")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync status")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace status file {:?}", self.path))?;
        debug!(count = records.len(), "Saved status records");
        Ok(())
    }
}
