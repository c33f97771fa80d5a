//! Loading page rasters, along with their resolution.

use std::{fs, io::BufReader};

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult, ifd::Value},
    tags::Tag,
};

use crate::{errors::PipelineError, prelude::*};

/// TIFF `ResolutionUnit` values.
mod resolution_unit {
    pub const INCH: u16 = 2;
    pub const CENTIMETER: u16 = 3;
}

/// A decoded page image.
#[derive(Debug)]
pub struct Raster {
    /// The pixels.
    pub image: DynamicImage,

    /// Horizontal resolution in dots per inch, if the file says.
    pub dpi: Option<f32>,
}

impl Raster {
    /// Width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// The resolution to use for layout.
    pub fn dpi_or(&self, fallback_dpi: f32) -> f32 {
        self.dpi.unwrap_or(fallback_dpi)
    }
}

/// Load the raster at `path`.
///
/// TIFF files are decoded directly, so that we can read their resolution
/// tags. Anything else goes through [`image`] and has no resolution.
pub fn load_raster(path: &Path) -> Result<Raster, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::image(path, "image does not exist"));
    }
    if is_tiff(path)? {
        load_tiff(path).map_err(|err| PipelineError::image(path, format!("{:#}", err)))
    } else {
        let image = image::ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|err| PipelineError::image(path, err))?
            .decode()
            .map_err(|err| PipelineError::image(path, err))?;
        Ok(Raster { image, dpi: None })
    }
}

/// Write a PNG copy of the page image at `image_path`.
pub fn write_png_preview(image_path: &Path, png_path: &Path) -> Result<(), PipelineError> {
    let raster = load_raster(image_path)?;
    if let Some(parent) = png_path.parent() {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    raster
        .image
        .save_with_format(png_path, image::ImageFormat::Png)
        .map_err(|err| PipelineError::image(png_path, err))?;
    debug!(preview = %png_path.display(), "Wrote PNG preview");
    Ok(())
}

/// Sniff the TIFF magic number. Page image extensions are configurable, so
/// we don't trust them.
fn is_tiff(path: &Path) -> Result<bool, PipelineError> {
    use std::io::Read as _;
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(PipelineError::io(path, err)),
        }
    }
    Ok(filled == magic.len() && (magic == *b"II*\0" || magic == *b"MM\0*"))
}

/// Decode the first image in a TIFF file.
fn load_tiff(path: &Path) -> Result<Raster> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).with_context(|| {
        format!("failed to create TIFF decoder for {:?}", path.display())
    })?;
    if decoder.more_images() {
        warn!(
            image = %path.display(),
            "TIFF has more than one image; only the first is used"
        );
    }

    let dpi = read_dpi(&mut decoder);
    let (width, height) = decoder.dimensions().with_context(|| {
        format!("failed to get dimensions of {:?}", path.display())
    })?;
    let image = decode_tiff_image(&mut decoder, width, height, path)?;
    Ok(Raster { image, dpi })
}

/// Read the horizontal resolution in dots per inch.
///
/// Returns `None` when the tags are missing, zero, or have no unit.
fn read_dpi<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
    let resolution = match decoder.find_tag(Tag::XResolution) {
        Ok(Some(Value::Rational(n, d))) if n > 0 && d > 0 => n as f32 / d as f32,
        _ => return None,
    };
    // The TIFF default unit is inches.
    let unit = match decoder.find_tag(Tag::ResolutionUnit) {
        Ok(Some(value)) => value.into_u16().ok()?,
        _ => resolution_unit::INCH,
    };
    match unit {
        resolution_unit::INCH => Some(resolution),
        resolution_unit::CENTIMETER => Some(resolution * 2.54),
        _ => None,
    }
}

/// Decode the current TIFF image to a [`DynamicImage`].
fn decode_tiff_image<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    width: u32,
    height: u32,
    path: &Path,
) -> Result<DynamicImage> {
    let color_type = decoder.colortype().with_context(|| {
        format!("failed to get color type of {:?}", path.display())
    })?;

    let result = decoder
        .read_image()
        .with_context(|| format!("failed to decode {:?}", path.display()))?;

    let bad_size = || {
        anyhow!(
            "pixel data does not match {}x{} {:?} image in {:?}",
            width,
            height,
            color_type,
            path.display()
        )
    };
    let image = match (result, color_type) {
        (DecodingResult::U8(data), ColorType::Gray(1)) => {
            let gray = unpack_bilevel(&data, width, height).ok_or_else(bad_size)?;
            DynamicImage::ImageLuma8(gray)
        }
        (DecodingResult::U8(data), ColorType::Gray(8)) => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).ok_or_else(bad_size)?)
        }
        (DecodingResult::U8(data), ColorType::RGB(8)) => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).ok_or_else(bad_size)?)
        }
        (DecodingResult::U8(data), ColorType::RGBA(8)) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, data).ok_or_else(bad_size)?,
        ),
        (DecodingResult::U16(data), ColorType::Gray(16) | ColorType::RGB(16)) => {
            // Convert 16-bit to 8-bit by scaling.
            let data_u8: Vec<u8> = data.iter().map(|&v| (v >> 8) as u8).collect();
            if matches!(color_type, ColorType::Gray(_)) {
                DynamicImage::ImageLuma8(
                    GrayImage::from_raw(width, height, data_u8).ok_or_else(bad_size)?,
                )
            } else {
                DynamicImage::ImageRgb8(
                    RgbImage::from_raw(width, height, data_u8).ok_or_else(bad_size)?,
                )
            }
        }
        (_, other) => {
            return Err(anyhow!(
                "unsupported TIFF color type {:?} in {:?}",
                other,
                path.display()
            ));
        }
    };
    Ok(image)
}

/// Expand 1-bit packed rows (each padded to a whole byte) into 8-bit gray.
/// A set bit is white, as the decoder has already applied the photometric
/// interpretation.
fn unpack_bilevel(data: &[u8], width: u32, height: u32) -> Option<GrayImage> {
    let row_bytes = (width as usize).div_ceil(8);
    if data.len() < row_bytes * height as usize {
        return None;
    }
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for row in data.chunks(row_bytes).take(height as usize) {
        for x in 0..width as usize {
            let bit = (row[x / 8] >> (7 - (x % 8))) & 1;
            pixels.push(if bit == 1 { 255 } else { 0 });
        }
    }
    GrayImage::from_raw(width, height, pixels)
}
