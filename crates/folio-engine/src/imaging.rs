use std::io::Cursor;

use anyhow::{bail, Context, Result};
use folio_contracts::image_data::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use sha2::{Digest, Sha256};

/// Fraction of the height trimmed from both the top and the bottom of a
/// previous-page image before it is chained in.
pub const CONTINUITY_CROP_FRACTION: f32 = 0.15;

pub fn decode(image: &ImageData) -> Result<DynamicImage> {
    if image.is_empty() {
        bail!("image payload is empty");
    }
    image::load_from_memory(&image.bytes)
        .with_context(|| format!("failed to decode {} payload", image.mime_type))
}

/// Downscales so the longest side is at most `max_side` (never upscales) and
/// re-encodes as JPEG on a white background.
pub fn compress_to_jpeg(image: &ImageData, max_side: u32, quality: u8) -> Result<ImageData> {
    shrink_to_jpeg(&decode(image)?, max_side, quality)
}

/// Trims `fraction` of the height from both top and bottom.
pub fn crop_vertical(image: &ImageData, fraction: f32) -> Result<DynamicImage> {
    let decoded = decode(image)?;
    let (width, height) = (decoded.width(), decoded.height());
    let trim = (height as f32 * fraction.clamp(0.0, 0.45)).round() as u32;
    let kept = height.saturating_sub(trim * 2);
    if kept == 0 || width == 0 {
        bail!("image too small to crop ({width}x{height})");
    }
    Ok(decoded.crop_imm(0, trim, width, kept))
}

pub fn crop_for_continuity(image: &ImageData) -> Result<DynamicImage> {
    crop_vertical(image, CONTINUITY_CROP_FRACTION)
}

/// Previous page as chained into a generation call: cropped, then encoded
/// once under the given limits.
pub fn continuity_page(image: &ImageData, max_side: u32, quality: u8) -> Result<ImageData> {
    shrink_to_jpeg(&crop_for_continuity(image)?, max_side, quality)
}

fn shrink_to_jpeg(decoded: &DynamicImage, max_side: u32, quality: u8) -> Result<ImageData> {
    let longest = decoded.width().max(decoded.height());
    let flattened = flatten_alpha(decoded);
    let resized = if longest > max_side {
        flattened.resize(max_side, max_side, FilterType::Triangle)
    } else {
        flattened
    };
    encode_jpeg(&resized, quality)
}

/// Deterministic solid-color PNG; the color is derived from the prompt.
pub fn solid_color_png(prompt: &str, width: u32, height: u32) -> Result<ImageData> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width.max(1), height.max(1));
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(ImageData::png(bytes))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn flatten_alpha(image: &DynamicImage) -> DynamicImage {
    if !image.color().has_alpha() {
        return image.clone();
    }
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    DynamicImage::ImageRgba8(flattened)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<ImageData> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(ImageData::jpeg(bytes))
}
