//! Pure image transformations.
//!
//! Every operation here is bytes in, bytes out: decoding, resizing,
//! re-encoding, auto-format selection, blur placeholders, watermark
//! compositing and metadata extraction. The transformer never touches the
//! filesystem or the network; callers own all I/O.

use std::io::Cursor;

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::codecs::avif::AvifEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::imageops::FilterType;
use image::{
    ColorType, DynamicImage, GenericImageView, ImageEncoder, ImageFormat, Rgba, RgbaImage,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Output encodings accepted by the service. `Auto` picks the smallest
/// encoding among a fixed candidate set at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
    Avif,
    Gif,
    Tiff,
    Auto,
}

/// Candidate order doubles as the tie-break order for `Auto`.
pub const AUTO_CANDIDATES: [OutputFormat; 4] = [
    OutputFormat::Jpeg,
    OutputFormat::Webp,
    OutputFormat::Avif,
    OutputFormat::Png,
];

impl OutputFormat {
    pub const SUPPORTED: &'static [&'static str] =
        &["jpeg", "png", "webp", "avif", "gif", "tiff", "auto"];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "gif" => Some(Self::Gif),
            "tiff" => Some(Self::Tiff),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Auto => "auto",
        }
    }

    /// Extension used for minted destination keys. The key must exist before
    /// `Auto` resolves, so it borrows the first candidate's extension.
    pub fn path_extension(&self) -> &'static str {
        match self {
            Self::Auto => "jpeg",
            other => other.as_str(),
        }
    }

    pub fn mime(&self) -> String {
        format!("image/{}", self.path_extension())
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request optimization parameters. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: OutputFormat,
    pub blur_radius: Option<u32>,
    pub mobile_optimized: bool,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            quality: 80,
            format: OutputFormat::Jpeg,
            blur_radius: None,
            mobile_optimized: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatermarkOptions {
    pub font_size: Option<f32>,
    pub font_weight: Option<String>,
    pub color: Option<String>,
    pub opacity: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlurPlaceholderOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blur_radius: u32,
    pub quality: u8,
    pub mobile_optimized: bool,
}

impl Default for BlurPlaceholderOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            blur_radius: 15,
            quality: 15,
            mobile_optimized: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size: usize,
    pub channels: u8,
    pub density: Option<u32>,
}

/// Result of an `optimize` run; `format` is the concrete encoding chosen,
/// which differs from the requested one only for `Auto`.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to decode input image: {0}")]
    Decode(String),

    #[error("{format} encoding failed: {reason}")]
    Encode {
        format: &'static str,
        reason: String,
    },

    #[error("no auto-format candidate could be encoded")]
    AutoExhausted,

    #[error("watermark font not configured")]
    FontUnavailable,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

const PLACEHOLDER_GREY: Rgba<u8> = Rgba([128, 128, 128, 255]);
const MOBILE_PLACEHOLDER_MAX_WIDTH: u32 = 40;
const MOBILE_PLACEHOLDER_MIN_WIDTH: u32 = 20;
const CONVERT_QUALITY: u8 = 90;
const THUMBNAIL_QUALITY: u8 = 80;

pub struct ImageTransformer {
    watermark_font: Option<FontVec>,
}

impl Default for ImageTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTransformer {
    pub fn new() -> Self {
        Self {
            watermark_font: None,
        }
    }

    /// Attach a TTF/OTF font for watermark rendering.
    pub fn with_watermark_font(mut self, font_bytes: Vec<u8>) -> Result<Self, TransformError> {
        let font = FontVec::try_from_vec(font_bytes)
            .map_err(|_| TransformError::InvalidParameter("unreadable watermark font".into()))?;
        self.watermark_font = Some(font);
        Ok(self)
    }

    pub fn has_watermark_font(&self) -> bool {
        self.watermark_font.is_some()
    }

    /// Resize to fit inside the requested box (never enlarging) and encode
    /// per the requested format. `Auto` returns the smallest successful
    /// candidate encoding, ties broken by candidate order.
    pub fn optimize(
        &self,
        bytes: &[u8],
        options: &OptimizationOptions,
    ) -> Result<Optimized, TransformError> {
        let img = decode(bytes)?;
        let img = fit_inside(img, options.width, options.height);
        match options.format {
            OutputFormat::Auto => {
                let mut best: Option<(Vec<u8>, OutputFormat)> = None;
                for candidate in AUTO_CANDIDATES {
                    match encode(&img, candidate, options.quality) {
                        Ok(buf) => {
                            if best.as_ref().map_or(true, |(b, _)| buf.len() < b.len()) {
                                best = Some((buf, candidate));
                            }
                        }
                        Err(err) => {
                            debug!(candidate = %candidate, %err, "auto-format candidate skipped");
                        }
                    }
                }
                let (bytes, format) = best.ok_or(TransformError::AutoExhausted)?;
                Ok(Optimized { bytes, format })
            }
            concrete => Ok(Optimized {
                bytes: encode(&img, concrete, options.quality)?,
                format: concrete,
            }),
        }
    }

    /// Re-encode without resizing, at a high default quality.
    pub fn convert(&self, bytes: &[u8], format: OutputFormat) -> Result<Vec<u8>, TransformError> {
        let options = OptimizationOptions {
            quality: CONVERT_QUALITY,
            format,
            ..Default::default()
        };
        Ok(self.optimize(bytes, &options)?.bytes)
    }

    /// Fixed-size thumbnail: `cover` fit (center-weighted crop) when a height
    /// is given, `inside` fit otherwise. Never enlarges. JPEG output.
    pub fn thumbnail(
        &self,
        bytes: &[u8],
        width: u32,
        height: Option<u32>,
    ) -> Result<Vec<u8>, TransformError> {
        if width == 0 {
            return Err(TransformError::InvalidParameter(
                "thumbnail width must be positive".into(),
            ));
        }
        let img = decode(bytes)?;
        let (sw, sh) = img.dimensions();
        let out = match height {
            Some(h) if h > 0 => {
                img.resize_to_fill(width.min(sw).max(1), h.min(sh).max(1), FilterType::CatmullRom)
            }
            Some(_) => {
                return Err(TransformError::InvalidParameter(
                    "thumbnail height must be positive".into(),
                ))
            }
            None => fit_inside(img, Some(width), None),
        };
        encode(&out, OutputFormat::Jpeg, THUMBNAIL_QUALITY)
    }

    /// Composite a text label at bottom-center (x=50%, y=95%) of the source,
    /// re-encoding in the source's own format.
    pub fn watermark(
        &self,
        bytes: &[u8],
        text: &str,
        options: &WatermarkOptions,
    ) -> Result<Vec<u8>, TransformError> {
        let font = self
            .watermark_font
            .as_ref()
            .ok_or(TransformError::FontUnavailable)?;
        if text.is_empty() {
            return Err(TransformError::InvalidParameter(
                "watermark text must not be empty".into(),
            ));
        }
        let source_format = image::guess_format(bytes).ok();
        let img = decode(bytes)?;
        let (w, h) = img.dimensions();
        let mut canvas = img.to_rgba8();

        let size = options
            .font_size
            .unwrap_or_else(|| (w.min(h) as f32 / 20.0).max(8.0));
        let color = parse_color(options.color.as_deref())?;
        let opacity = options.opacity.unwrap_or(0.7).clamp(0.0, 1.0);
        let bold = options
            .font_weight
            .as_deref()
            .map(is_bold_weight)
            .unwrap_or(false);

        let scale = PxScale::from(size);
        let scaled = font.as_scaled(scale);
        let text_width: f32 = text
            .chars()
            .map(|c| scaled.h_advance(scaled.glyph_id(c)))
            .sum();
        let origin_x = ((w as f32 - text_width) / 2.0).max(0.0);
        let baseline_y = h as f32 * 0.95;

        // Faux bold: a second pass shifted one pixel right.
        let passes: &[f32] = if bold { &[0.0, 1.0] } else { &[0.0] };
        for dx in passes {
            let mut caret = origin_x + dx;
            for ch in text.chars() {
                let id = scaled.glyph_id(ch);
                let glyph = id.with_scale_and_position(scale, ab_glyph::point(caret, baseline_y));
                caret += scaled.h_advance(id);
                let Some(outline) = font.outline_glyph(glyph) else {
                    continue;
                };
                let bounds = outline.px_bounds();
                outline.draw(|gx, gy, coverage| {
                    let px = bounds.min.x as i32 + gx as i32;
                    let py = bounds.min.y as i32 + gy as i32;
                    if px < 0 || py < 0 || px >= w as i32 || py >= h as i32 {
                        return;
                    }
                    let alpha = (coverage * opacity).clamp(0.0, 1.0);
                    let pixel = canvas.get_pixel_mut(px as u32, py as u32);
                    for (channel, target) in pixel.0.iter_mut().take(3).zip(color) {
                        *channel =
                            (*channel as f32 * (1.0 - alpha) + target as f32 * alpha).round() as u8;
                    }
                });
            }
        }

        encode_like_source(&DynamicImage::ImageRgba8(canvas), source_format)
    }

    /// Tiny blurred stand-in for progressive loading. With `mobileOptimized`
    /// and no explicit height the width is capped at 40px and the height is
    /// derived from the source aspect ratio; an explicit height is honored by
    /// `contain`-fitting onto a neutral grey canvas.
    pub fn blur_placeholder(
        &self,
        bytes: &[u8],
        options: &BlurPlaceholderOptions,
    ) -> Result<Vec<u8>, TransformError> {
        let img = decode(bytes)?;
        let (sw, sh) = img.dimensions();

        let small = if options.mobile_optimized && options.height.is_none() {
            let mut width = options
                .width
                .unwrap_or(MOBILE_PLACEHOLDER_MAX_WIDTH)
                .min(MOBILE_PLACEHOLDER_MAX_WIDTH);
            if options.width.is_none() {
                // Never scale a small source up past its own width, but keep
                // the placeholder recognizable.
                width = width.min(sw).max(MOBILE_PLACEHOLDER_MIN_WIDTH);
            }
            let height = ((width as f32 * sh as f32) / sw as f32).round().max(1.0) as u32;
            img.resize_exact(width, height, FilterType::Triangle)
        } else {
            let width = options.width.unwrap_or(MOBILE_PLACEHOLDER_MAX_WIDTH).max(1);
            match options.height {
                Some(height) => contain_on_grey(&img, width, height.max(1)),
                None => fit_inside(img, Some(width), None),
            }
        };

        let blurred = small.blur(options.blur_radius.max(1) as f32);
        let quality = if options.mobile_optimized {
            options.quality.saturating_sub(5).max(10)
        } else {
            options.quality
        };
        encode(&blurred, OutputFormat::Jpeg, quality)
    }

    pub fn metadata(&self, bytes: &[u8]) -> Result<ImageMetadata, TransformError> {
        let format = image::guess_format(bytes)
            .map(format_name)
            .unwrap_or("unknown");
        let img = decode(bytes)?;
        let (width, height) = img.dimensions();
        Ok(ImageMetadata {
            width,
            height,
            format: format.to_string(),
            size: bytes.len(),
            channels: img.color().channel_count(),
            density: None,
        })
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, TransformError> {
    image::load_from_memory(bytes).map_err(|e| TransformError::Decode(e.to_string()))
}

/// Fit inside the requested box preserving aspect ratio, never enlarging.
/// Unset box edges default to the source dimension.
fn fit_inside(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    if width.is_none() && height.is_none() {
        return img;
    }
    let (sw, sh) = img.dimensions();
    let bw = width.unwrap_or(sw).min(sw).max(1);
    let bh = height.unwrap_or(sh).min(sh).max(1);
    if bw >= sw && bh >= sh {
        return img;
    }
    img.resize(bw, bh, FilterType::CatmullRom)
}

/// `contain` fit onto a neutral grey canvas of exactly `width`x`height`.
fn contain_on_grey(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let resized = img.resize(width, height, FilterType::Triangle).to_rgba8();
    let mut canvas = RgbaImage::from_pixel(width, height, PLACEHOLDER_GREY);
    let x = (width.saturating_sub(resized.width()) / 2) as i64;
    let y = (height.saturating_sub(resized.height()) / 2) as i64;
    image::imageops::overlay(&mut canvas, &resized, x, y);
    DynamicImage::ImageRgba8(canvas)
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, TransformError> {
    let quality = quality.clamp(1, 100);
    let (width, height) = img.dimensions();
    let mut buf = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality)
                .encode_image(&rgb)
                .map_err(|e| encode_err("jpeg", e))?;
        }
        OutputFormat::Png => {
            let rgba = img.to_rgba8();
            PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive)
                .write_image(rgba.as_raw(), width, height, ColorType::Rgba8)
                .map_err(|e| encode_err("png", e))?;
        }
        OutputFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            let encoder = webp::Encoder::from_image(&rgba).map_err(|e| TransformError::Encode {
                format: "webp",
                reason: e.to_string(),
            })?;
            buf = encoder.encode(quality as f32).to_vec();
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut buf, 6, quality)
                .write_image(rgba.as_raw(), width, height, ColorType::Rgba8)
                .map_err(|e| encode_err("avif", e))?;
        }
        OutputFormat::Gif => {
            let rgba = img.to_rgba8();
            GifEncoder::new(&mut buf)
                .encode(rgba.as_raw(), width, height, ColorType::Rgba8)
                .map_err(|e| encode_err("gif", e))?;
        }
        OutputFormat::Tiff => {
            let rgba = img.to_rgba8();
            let mut cursor = Cursor::new(Vec::new());
            TiffEncoder::new(&mut cursor)
                .write_image(rgba.as_raw(), width, height, ColorType::Rgba8)
                .map_err(|e| encode_err("tiff", e))?;
            buf = cursor.into_inner();
        }
        OutputFormat::Auto => {
            return Err(TransformError::InvalidParameter(
                "auto must be resolved before encoding".into(),
            ))
        }
    }
    Ok(buf)
}

fn encode_err(format: &'static str, err: image::ImageError) -> TransformError {
    TransformError::Encode {
        format,
        reason: err.to_string(),
    }
}

/// Re-encode in the source's own container where we can, PNG otherwise.
fn encode_like_source(
    img: &DynamicImage,
    source: Option<ImageFormat>,
) -> Result<Vec<u8>, TransformError> {
    let format = match source {
        Some(ImageFormat::Jpeg) => OutputFormat::Jpeg,
        Some(ImageFormat::WebP) => OutputFormat::Webp,
        Some(ImageFormat::Gif) => OutputFormat::Gif,
        Some(ImageFormat::Tiff) => OutputFormat::Tiff,
        _ => OutputFormat::Png,
    };
    encode(img, format, CONVERT_QUALITY)
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Avif => "avif",
        _ => "unknown",
    }
}

fn is_bold_weight(weight: &str) -> bool {
    match weight.to_ascii_lowercase().as_str() {
        "bold" | "bolder" => true,
        numeric => numeric.parse::<u32>().map(|n| n >= 600).unwrap_or(false),
    }
}

fn parse_color(color: Option<&str>) -> Result<[u8; 3], TransformError> {
    let Some(raw) = color else {
        return Ok([255, 255, 255]);
    };
    match raw.to_ascii_lowercase().as_str() {
        "white" => return Ok([255, 255, 255]),
        "black" => return Ok([0, 0, 0]),
        "grey" | "gray" => return Ok([128, 128, 128]),
        _ => {}
    }
    let hex = raw.strip_prefix('#').unwrap_or(raw);
    let expanded: String = if hex.len() == 3 {
        hex.chars().flat_map(|c| [c, c]).collect()
    } else {
        hex.to_string()
    };
    if expanded.len() != 6 || !expanded.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TransformError::InvalidParameter(format!(
            "unrecognized watermark color '{raw}'"
        )));
    }
    let parse = |s: &str| u8::from_str_radix(s, 16).unwrap_or(255);
    Ok([
        parse(&expanded[0..2]),
        parse(&expanded[2..4]),
        parse(&expanded[4..6]),
    ])
}
