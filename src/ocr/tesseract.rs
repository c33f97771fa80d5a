//! Tesseract OCR engine.

use std::{
    collections::{BTreeSet, HashMap},
    process::Output,
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use tokio::process::Command;

use super::{OcrEngine, OcrResultSet, TextRegion};
use crate::{
    async_utils::check_for_command_failure, config::OcrConfig, errors::PipelineError,
    prelude::*,
};

/// Tesseract sometimes exits successfully after failing to process an image.
static PROCESSING_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Error during processing").expect("failed to compile regex")
});

/// TSV row level for individual words.
const WORD_LEVEL: u32 = 5;

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractOcrEngine {
    /// Language profile, such as `jpn` or `jpn+eng`.
    language: String,

    /// Maximum time to wait for one image.
    timeout: Duration,
}

impl TesseractOcrEngine {
    /// Check that `tesseract` and the requested language data are installed.
    pub async fn new(config: &OcrConfig) -> Result<Self> {
        let output = Command::new("tesseract")
            .arg("--list-langs")
            .output()
            .await
            .context("cannot run tesseract (install tesseract-ocr)")?;
        if !output.status.success() {
            return Err(anyhow!(
                "tesseract --list-langs failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        let installed = parse_language_list(&output);
        for lang in config.language.split('+') {
            if !installed.contains(lang) {
                return Err(anyhow!(
                    "tesseract language data {:?} is not installed (have: {})",
                    lang,
                    installed.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
        }
        info!(language = %config.language, "Using tesseract");
        Ok(Self {
            language: config.language.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(image = %image_path.display()))]
    async fn recognize(&self, image_path: &Path) -> Result<OcrResultSet, PipelineError> {
        if !image_path.is_file() {
            return Err(PipelineError::ocr(image_path, "image does not exist"));
        }

        // Dropping the future on timeout drops the child, which kills it.
        let child = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(PipelineError::ocr(
                    image_path,
                    format!("cannot run tesseract: {}", err),
                ));
            }
            Err(_) => {
                return Err(PipelineError::ocr(
                    image_path,
                    format!("tesseract timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };
        check_for_command_failure("tesseract", &output, Some(&PROCESSING_ERROR_REGEX))
            .map_err(|err| PipelineError::ocr(image_path, err))?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let result = parse_tsv(&tsv).map_err(|err| PipelineError::ocr(image_path, err))?;
        debug!(regions = result.len(), "Recognized text");
        Ok(result)
    }
}

/// Parse the output of `tesseract --list-langs`.
///
/// Depending on the version, the list may be on either stdout or stderr.
fn parse_language_list(output: &Output) -> BTreeSet<String> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available"))
        .map(str::to_owned)
        .collect()
}

/// A line of text being assembled from word rows.
struct LineBuilder {
    text: String,
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

impl LineBuilder {
    fn push_word(&mut self, word: &str, left: f32, top: f32, right: f32, bottom: f32) {
        if let (Some(prev), Some(next)) = (self.text.chars().last(), word.chars().next())
            && !is_cjk(prev)
            && !is_cjk(next)
        {
            self.text.push(' ');
        }
        self.text.push_str(word);
        self.left = self.left.min(left);
        self.top = self.top.min(top);
        self.right = self.right.max(right);
        self.bottom = self.bottom.max(bottom);
    }
}

/// Parse tesseract's TSV output into one region per text line.
///
/// Each line's polygon is the union of its words' bounding boxes. Lines come
/// out in the order tesseract reports them.
fn parse_tsv(tsv: &str) -> Result<OcrResultSet> {
    let mut lines = tsv.lines();
    let header = lines.next().unwrap_or_default();
    let columns = header.split('\t').collect::<Vec<_>>();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("tesseract TSV output has no {:?} column", name))
    };
    let level_col = column("level")?;
    let key_cols = [
        column("page_num")?,
        column("block_num")?,
        column("par_num")?,
        column("line_num")?,
    ];
    let left_col = column("left")?;
    let top_col = column("top")?;
    let width_col = column("width")?;
    let height_col = column("height")?;
    let text_col = column("text")?;

    let mut order = vec![];
    let mut builders: HashMap<[u32; 4], LineBuilder> = HashMap::new();
    for (line_idx, row) in lines.enumerate() {
        if row.trim().is_empty() {
            continue;
        }
        let fields = row.split('\t').collect::<Vec<_>>();
        let int = |col: usize| -> Result<i64> {
            let value = fields.get(col).copied().unwrap_or_default();
            value.trim().parse::<i64>().with_context(|| {
                format!("bad number {:?} in tesseract TSV row {}", value, line_idx + 2)
            })
        };
        if int(level_col)? != i64::from(WORD_LEVEL) {
            continue;
        }
        let word = fields.get(text_col).copied().unwrap_or_default().trim();
        if word.is_empty() {
            continue;
        }
        let key = [
            int(key_cols[0])? as u32,
            int(key_cols[1])? as u32,
            int(key_cols[2])? as u32,
            int(key_cols[3])? as u32,
        ];
        let left = int(left_col)? as f32;
        let top = int(top_col)? as f32;
        let right = left + int(width_col)? as f32;
        let bottom = top + int(height_col)? as f32;
        builders
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                LineBuilder {
                    text: String::new(),
                    left,
                    top,
                    right,
                    bottom,
                }
            })
            .push_word(word, left, top, right, bottom);
    }

    let regions = order
        .into_iter()
        .filter_map(|key| builders.remove(&key))
        .map(|b| TextRegion::from_box(b.text, b.left, b.top, b.right, b.bottom))
        .collect();
    Ok(OcrResultSet { regions })
}

/// Is this a character from a script written without spaces between words?
fn is_cjk(c: char) -> bool {
    matches!(
        u32::from(c),
        0x3000..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0xFF00..=0xFFEF
    )
}
