//! OCR engine interface.
//!
//! An engine takes the path to one raster image and returns the text it found,
//! with a bounding polygon for each region in the image's pixel coordinates.
//! Engines may be slow (seconds per image), so callers should not assume
//! anything about latency.

use std::sync::Arc;

use crate::{config::OcrConfig, errors::PipelineError, prelude::*};

pub mod none;
pub mod tesseract;

/// A point in image pixel space. `y` grows downwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    /// Create a new point.
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One recognized region of text.
#[derive(Clone, Debug, PartialEq)]
pub struct TextRegion {
    /// The recognized text. May be empty.
    pub text: String,

    /// Corners of the region, clockwise from the top-left. Well-formed
    /// polygons have at least 4 points.
    pub polygon: Vec<Point>,
}

impl TextRegion {
    /// Build a region from an axis-aligned box.
    pub fn from_box(text: impl Into<String>, left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            text: text.into(),
            polygon: vec![
                Point::new(left, top),
                Point::new(right, top),
                Point::new(right, bottom),
                Point::new(left, bottom),
            ],
        }
    }
}

/// Everything an engine recognized on one image, in reading order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OcrResultSet {
    pub regions: Vec<TextRegion>,
}

impl OcrResultSet {
    /// Did the engine find nothing?
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// How many regions did the engine find?
    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

/// Interface to an OCR engine.
///
/// Engines are acquired once per batch and reused for every image, because
/// starting one up can be expensive.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Recognize the text in one image. Finding no text is not an error.
    async fn recognize(&self, image_path: &Path) -> Result<OcrResultSet, PipelineError>;
}

/// Acquire the engine named in `config`.
#[instrument(level = "debug", skip_all, fields(engine = %config.engine))]
pub async fn ocr_engine_for_config(config: &OcrConfig) -> Result<Arc<dyn OcrEngine>> {
    match config.engine.as_str() {
        "tesseract" => Ok(Arc::new(tesseract::TesseractOcrEngine::new(config).await?)),
        "none" => Ok(Arc::new(none::NoOcrEngine)),
        other => Err(anyhow!(
            "unknown OCR engine {:?} (supported: tesseract, none)",
            other
        )),
    }
}
