//! Heatmap rendering for clinician display.
//!
//! Jet colormap of the saliency blended over the original film, then PNG /
//! base64 for transport. Rendering never feeds back into the decision.

use std::io::Cursor;

use base64::Engine;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

use super::explain::SaliencyMap;
use super::preprocess::validate_image;
use super::xray::XrayImage;
use super::AnalysisError;

/// Heatmap weight in the blend.
pub const DEFAULT_OVERLAY_ALPHA: f32 = 0.6;

/// Jet colormap: 0 → dark blue, 0.5 → green, 1 → dark red.
pub fn jet(v: f32) -> Rgb<u8> {
    let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Saliency alone, colormapped.
pub fn render_heatmap(saliency: &SaliencyMap) -> RgbImage {
    let (w, h) = (saliency.width() as u32, saliency.height() as u32);
    RgbImage::from_fn(w, h, |x, y| {
        jet(saliency.get(y as usize, x as usize).unwrap_or(0.0))
    })
}

/// `(1 - alpha) * original + alpha * heatmap`, per pixel.
pub fn render_overlay(
    image: &XrayImage,
    saliency: &SaliencyMap,
    alpha: f32,
) -> Result<RgbImage, AnalysisError> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(AnalysisError::Render(format!(
            "overlay alpha must lie in [0, 1], got {alpha}"
        )));
    }
    validate_image(image)?;
    if saliency.width() != image.width() as usize || saliency.height() != image.height() as usize {
        return Err(AnalysisError::Render(format!(
            "saliency {}x{} does not match image {}x{}",
            saliency.width(),
            saliency.height(),
            image.width(),
            image.height()
        )));
    }

    let mut out = image.to_rgb8();
    let heat = render_heatmap(saliency);
    for (px, hp) in out.pixels_mut().zip(heat.pixels()) {
        for (o, &h) in px.0.iter_mut().zip(hp.0.iter()) {
            *o = ((1.0 - alpha) * *o as f32 + alpha * h as f32).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, AnalysisError> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| AnalysisError::Render(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// PNG bytes, standard base64.
pub fn encode_png_base64(img: &RgbImage) -> Result<String, AnalysisError> {
    Ok(base64::engine::general_purpose::STANDARD.encode(encode_png(img)?))
}
