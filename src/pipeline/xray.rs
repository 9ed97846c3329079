//! Raw image value consumed by the pipeline, plus the loader glue that
//! decodes encoded files into it.
//!
//! `XrayImage` is immutable once built. Structural checks here are limited to
//! buffer length; semantic validation (dimensions, channel count, finite
//! samples) belongs to the preprocessor so malformed images fail inside
//! `analyze` with a proper error kind.

use std::path::Path;

use image::{DynamicImage, GenericImageView, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AnalysisError;

/// Maximum encoded image size (in bytes) accepted by the loader.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Smallest valid PNG is ~67 bytes.
const MIN_IMAGE_BYTES: usize = 67;

/// Declared numeric range of the raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub const UNIT: Self = Self { min: 0.0, max: 1.0 };
    pub const U8: Self = Self { min: 0.0, max: 255.0 };
    pub const U16: Self = Self { min: 0.0, max: 65535.0 };

    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.max > self.min
    }

    /// Map a raw sample into [0, 1], clamping samples outside the range.
    pub fn to_unit(&self, sample: f32) -> f32 {
        ((sample - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// Immutable 2-D image with interleaved channels (`y`, `x`, `c` order).
#[derive(Debug, Clone, PartialEq)]
pub struct XrayImage {
    width: u32,
    height: u32,
    channels: u8,
    range: ValueRange,
    samples: Vec<f32>,
}

impl XrayImage {
    /// Build an image from interleaved samples.
    ///
    /// Only the buffer length is checked; an image with zero width is
    /// representable and is rejected later by `prepare`.
    pub fn from_raw(
        width: u32,
        height: u32,
        channels: u8,
        range: ValueRange,
        samples: Vec<f32>,
    ) -> Result<Self, AnalysisError> {
        let expected = width as usize * height as usize * channels as usize;
        if samples.len() != expected {
            return Err(AnalysisError::InvalidImage(format!(
                "sample buffer has {} values, expected {expected} for {width}x{height}x{channels}",
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            range,
            samples,
        })
    }

    /// Convert a decoded `DynamicImage`, keeping 16-bit depth where present.
    /// Alpha is dropped; any non-gray layout becomes 3-channel RGB.
    pub fn from_dynamic(img: &DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        let (channels, range, samples): (u8, ValueRange, Vec<f32>) = match img {
            DynamicImage::ImageLuma8(buf) => {
                (1, ValueRange::U8, buf.as_raw().iter().map(|&v| v as f32).collect())
            }
            DynamicImage::ImageLuma16(buf) => {
                (1, ValueRange::U16, buf.as_raw().iter().map(|&v| v as f32).collect())
            }
            DynamicImage::ImageLumaA8(_) => {
                let gray = img.to_luma8();
                (1, ValueRange::U8, gray.as_raw().iter().map(|&v| v as f32).collect())
            }
            DynamicImage::ImageRgb16(buf) => {
                (3, ValueRange::U16, buf.as_raw().iter().map(|&v| v as f32).collect())
            }
            _ => {
                let rgb = img.to_rgb8();
                (3, ValueRange::U8, rgb.as_raw().iter().map(|&v| v as f32).collect())
            }
        };
        Self {
            width,
            height,
            channels,
            range,
            samples,
        }
    }

    /// Decode an encoded image (PNG, JPEG, TIFF).
    pub fn decode(bytes: &[u8]) -> Result<Self, AnalysisError> {
        validate_image_bytes(bytes)?;
        let img = image::load_from_memory(bytes)
            .map_err(|e| AnalysisError::InvalidImage(format!("Failed to decode image: {e}")))?;
        let decoded = Self::from_dynamic(&img);
        debug!(
            size = format!("{}x{}", decoded.width, decoded.height),
            channels = decoded.channels,
            "Image decoded"
        );
        Ok(decoded)
    }

    /// Read and decode an image file.
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn range(&self) -> ValueRange {
        self.range
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Raw sample at (`x`, `y`, `channel`). Caller guarantees bounds.
    pub fn sample(&self, x: u32, y: u32, channel: u8) -> f32 {
        let idx = ((y as usize * self.width as usize) + x as usize) * self.channels as usize
            + channel as usize;
        self.samples[idx]
    }

    /// Luma plane rescaled to [0, 1], row-major. BT.601 weights for RGB.
    pub fn to_unit_gray(&self) -> Vec<f32> {
        let c = self.channels as usize;
        if c == 0 {
            return Vec::new();
        }
        self.samples
            .chunks_exact(c)
            .map(|px| {
                if c >= 3 {
                    luma(
                        self.range.to_unit(px[0]),
                        self.range.to_unit(px[1]),
                        self.range.to_unit(px[2]),
                    )
                } else {
                    self.range.to_unit(px[0])
                }
            })
            .collect()
    }

    /// 8-bit RGB rendition for display (gray is replicated).
    pub fn to_rgb8(&self) -> RgbImage {
        let c = self.channels as usize;
        let mut rgb = RgbImage::new(self.width, self.height);
        if c == 0 {
            return rgb;
        }
        for (px, out) in self.samples.chunks_exact(c).zip(rgb.pixels_mut()) {
            let quantize = |v: f32| (self.range.to_unit(v) * 255.0).round() as u8;
            out.0 = if c >= 3 {
                [quantize(px[0]), quantize(px[1]), quantize(px[2])]
            } else {
                let g = quantize(px[0]);
                [g, g, g]
            };
        }
        rgb
    }
}

/// ITU-R BT.601 luma.
pub fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// Reject encoded buffers that are too small to be an image or large enough
/// to risk OOM during decode.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), AnalysisError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(AnalysisError::InvalidImage(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AnalysisError::InvalidImage(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}
