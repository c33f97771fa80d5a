//! Searchable PDF synthesis.
//!
//! Each output is a one-page PDF. The page shows the original raster, and
//! carries an invisible text layer (rendering mode 3) placed over the regions
//! the OCR engine recognized, so viewers can search and select the text.
//!
//! Coordinates arrive in image pixels with `y` growing downwards. PDF user
//! space is in points with `y` growing upwards, so every coordinate is scaled
//! by `72 / dpi` and flipped.

use std::{fs, io};

use image::DynamicImage;
use lopdf::{
    Dictionary, Document, Object, Stream, StringFormat,
    content::{Content, Operation},
    dictionary,
};

use crate::{
    errors::PipelineError,
    ocr::{OcrResultSet, TextRegion},
    prelude::*,
    raster::load_raster,
};

/// Font size as a fraction of the region height. Glyph boxes are taller than
/// the ink they contain.
const FONT_SIZE_RATIO: f32 = 0.75;

/// The baseline sits this far (as a fraction of the region height) above the
/// bottom of the region, leaving room for descenders.
const BASELINE_OFFSET_RATIO: f32 = 0.1;

/// Replacement for characters outside the Basic Multilingual Plane, which
/// `UniJIS-UCS2-H` cannot encode.
const GETA_MARK: u16 = 0x3013;

/// Built-in Latin font resource name.
const LATIN_FONT: &str = "F1";

/// Japanese CID font resource name.
const CJK_FONT: &str = "F2";

/// Raster resource name.
const PAGE_IMAGE: &str = "Im1";

/// Summary of one synthesized page.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SynthesisReport {
    /// Page width in points.
    pub page_width: f32,
    /// Page height in points.
    pub page_height: f32,
    /// Points per pixel.
    pub scale: f32,
    /// How many text spans were inserted.
    pub text_spans: usize,
}

/// Which font a span is drawn with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SpanFont {
    Latin,
    Cjk,
}

/// A text span positioned in page space.
#[derive(Clone, Debug, PartialEq)]
struct TextSpan {
    text: String,
    font: SpanFont,
    font_size: f32,
    x: f32,
    y: f32,
}

impl TextSpan {
    /// Position `region` on a page of `image_height` pixels.
    ///
    /// Returns `Ok(None)` for blank text.
    fn layout(
        region: &TextRegion,
        image_height: f32,
        scale: f32,
        image_path: &Path,
    ) -> Result<Option<Self>, PipelineError> {
        let text = region
            .text
            .chars()
            .map(|c| if c.is_whitespace() { ' ' } else { c })
            .collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if region.polygon.len() < 4 {
            return Err(PipelineError::layout(
                image_path,
                format!(
                    "region {:?} has {} corner(s), expected at least 4",
                    text,
                    region.polygon.len()
                ),
            ));
        }

        let left = region.polygon.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let top = region.polygon.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
        let bottom = region
            .polygon
            .iter()
            .map(|p| p.y)
            .fold(f32::NEG_INFINITY, f32::max);
        let height = bottom - top;
        if !(height > 0.0 && left.is_finite()) {
            return Err(PipelineError::layout(
                image_path,
                format!("region {:?} has no height", text),
            ));
        }

        let baseline = bottom - BASELINE_OFFSET_RATIO * height;
        Ok(Some(Self {
            font: if is_win_ansi(text) {
                SpanFont::Latin
            } else {
                SpanFont::Cjk
            },
            text: text.to_owned(),
            font_size: FONT_SIZE_RATIO * height * scale,
            x: left * scale,
            y: (image_height - baseline) * scale,
        }))
    }

    /// The operand for `Tj`, encoded for our font.
    fn encoded_text(&self) -> Object {
        match self.font {
            SpanFont::Latin => Object::String(
                self.text.chars().map(|c| u32::from(c) as u8).collect(),
                StringFormat::Literal,
            ),
            SpanFont::Cjk => {
                let mut bytes = Vec::with_capacity(self.text.len() * 2);
                for c in self.text.chars() {
                    let code = u16::try_from(u32::from(c)).unwrap_or(GETA_MARK);
                    bytes.extend_from_slice(&code.to_be_bytes());
                }
                Object::String(bytes, StringFormat::Hexadecimal)
            }
        }
    }
}

/// Can `text` be drawn with a standard font using `WinAnsiEncoding`? We stick
/// to the printable Latin-1 characters, which have the same codes there.
fn is_win_ansi(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(u32::from(c), 0x20..=0x7E | 0xA0..=0xFF))
}

/// Write a searchable PDF for `image_path` to `output_path`.
///
/// Blank regions are skipped. Geometry is checked before anything is
/// written, so a [`PipelineError::Layout`] never leaves a partial file.
#[instrument(level = "debug", skip_all, fields(image = %image_path.display()))]
pub fn synthesize(
    image_path: &Path,
    ocr: &OcrResultSet,
    output_path: &Path,
    fallback_dpi: f32,
) -> Result<SynthesisReport, PipelineError> {
    let raster = load_raster(image_path)?;
    let (width_px, height_px) = raster.dimensions();
    let scale = 72.0 / raster.dpi_or(fallback_dpi);
    let page_width = width_px as f32 * scale;
    let page_height = height_px as f32 * scale;

    let mut spans = vec![];
    for region in &ocr.regions {
        if let Some(span) = TextSpan::layout(region, height_px as f32, scale, image_path)? {
            spans.push(span);
        }
    }

    let mut doc = build_document(&raster.image, page_width, page_height, &spans)
        .map_err(|err| PipelineError::image(image_path, err))?;
    doc.compress();
    let mut bytes = vec![];
    doc.save_to(&mut bytes)
        .map_err(|err| PipelineError::io(output_path, io::Error::other(err.to_string())))?;

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    fs::write(output_path, bytes).map_err(|err| PipelineError::io(output_path, err))?;

    debug!(
        output = %output_path.display(),
        text_spans = spans.len(),
        "Wrote searchable PDF"
    );
    Ok(SynthesisReport {
        page_width,
        page_height,
        scale,
        text_spans: spans.len(),
    })
}

/// Assemble the PDF objects for one page.
fn build_document(
    image: &DynamicImage,
    page_width: f32,
    page_height: f32,
    spans: &[TextSpan],
) -> Result<Document> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let (color_space, pixels) = if image.color().has_color() {
        ("DeviceRGB", image.to_rgb8().into_raw())
    } else {
        ("DeviceGray", image.to_luma8().into_raw())
    };
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(image.width()),
            "Height" => i64::from(image.height()),
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8,
        },
        pixels,
    ));

    let uses_latin = spans.iter().any(|s| s.font == SpanFont::Latin);
    let uses_cjk = spans.iter().any(|s| s.font == SpanFont::Cjk);
    let mut fonts = Dictionary::new();
    if uses_latin {
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        fonts.set(LATIN_FONT, font_id);
    }
    if uses_cjk {
        let font_id = add_cjk_font(&mut doc);
        fonts.set(CJK_FONT, font_id);
    }

    let mut operations = vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![
                Object::Real(page_width),
                0.into(),
                0.into(),
                Object::Real(page_height),
                0.into(),
                0.into(),
            ],
        ),
        Operation::new("Do", vec![Object::Name(PAGE_IMAGE.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ];
    if !spans.is_empty() {
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tr", vec![3.into()]));
        for span in spans {
            let font = match span.font {
                SpanFont::Latin => LATIN_FONT,
                SpanFont::Cjk => CJK_FONT,
            };
            operations.push(Operation::new(
                "Tf",
                vec![
                    Object::Name(font.as_bytes().to_vec()),
                    Object::Real(span.font_size),
                ],
            ));
            operations.push(Operation::new(
                "Tm",
                vec![
                    1.into(),
                    0.into(),
                    0.into(),
                    1.into(),
                    Object::Real(span.x),
                    Object::Real(span.y),
                ],
            ));
            operations.push(Operation::new("Tj", vec![span.encoded_text()]));
        }
        operations.push(Operation::new("ET", vec![]));
    }
    let content = Content { operations }
        .encode()
        .map_err(|err| anyhow!("failed to encode page content: {}", err))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));

    let mut resources = dictionary! {
        "XObject" => dictionary! {
            PAGE_IMAGE => image_id,
        },
    };
    if uses_latin || uses_cjk {
        resources.set("Font", fonts);
    }
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![
            0.into(),
            0.into(),
            Object::Real(page_width),
            Object::Real(page_height),
        ],
        "Contents" => content_id,
        "Resources" => resources,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    Ok(doc)
}

/// Add a Type0 font for Japanese text, using one of the standard Adobe-Japan1
/// fonts that viewers are expected to substitute.
fn add_cjk_font(doc: &mut Document) -> lopdf::ObjectId {
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => "HeiseiKakuGo-W5",
        "Flags" => 4,
        "FontBBox" => vec![(-92).into(), (-250).into(), 1010.into(), 922.into()],
        "ItalicAngle" => 0,
        "Ascent" => 752,
        "Descent" => -221,
        "CapHeight" => 737,
        "StemV" => 114,
    });
    let descendant_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType0",
        "BaseFont" => "HeiseiKakuGo-W5",
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Japan1"),
            "Supplement" => 2,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
    });
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => "HeiseiKakuGo-W5-UniJIS-UCS2-H",
        "Encoding" => "UniJIS-UCS2-H",
        "DescendantFonts" => vec![descendant_id.into()],
    })
}
