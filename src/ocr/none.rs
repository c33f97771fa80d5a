//! An engine that never finds any text.
//!
//! Useful for turning scans into image-only PDFs, and for tests.

use super::{OcrEngine, OcrResultSet};
use crate::{errors::PipelineError, prelude::*};

/// OCR engine which returns an empty result for every image.
#[derive(Debug)]
pub struct NoOcrEngine;

#[async_trait]
impl OcrEngine for NoOcrEngine {
    fn name(&self) -> &str {
        "none"
    }

    async fn recognize(&self, image_path: &Path) -> Result<OcrResultSet, PipelineError> {
        if !image_path.is_file() {
            return Err(PipelineError::ocr(image_path, "image does not exist"));
        }
        Ok(OcrResultSet::default())
    }
}
