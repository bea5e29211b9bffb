//! Image preprocessing — RGB conversion, bounded resize and contrast
//! normalization ahead of inference.

use crate::types::{FaceLocation, ImageSource, RawImage};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

/// Default long-edge bound for the liveness path.
pub const DEFAULT_LIVENESS_MAX_DIMENSION: u32 = 640;
/// Default long-edge bound for the face encoding path.
pub const DEFAULT_ENCODING_MAX_DIMENSION: u32 = 480;

/// An RGB working copy of a [`RawImage`], never larger than the bound it was
/// prepared with. Remembers how to map coordinates back to the original.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    rgb: RgbImage,
    source: ImageSource,
    original_width: u32,
    original_height: u32,
}

impl PreprocessedImage {
    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }

    /// Horizontal and vertical factors from working to original coordinates.
    pub fn scale_to_original(&self) -> (f32, f32) {
        (
            self.original_width as f32 / self.rgb.width() as f32,
            self.original_height as f32 / self.rgb.height() as f32,
        )
    }

    /// Map a location detected on this working copy back to the original image.
    pub fn to_original(&self, location: &FaceLocation) -> FaceLocation {
        let (sx, sy) = self.scale_to_original();
        location.scaled(sx, sy)
    }
}

/// Prepare an image for face detection and encoding: RGB, long edge ≤ `max_dimension`.
pub fn for_encoding(raw: &RawImage, max_dimension: u32) -> PreprocessedImage {
    let rgb = bounded_resize(to_rgb(raw), max_dimension);
    PreprocessedImage {
        rgb,
        source: raw.source(),
        original_width: raw.width(),
        original_height: raw.height(),
    }
}

/// Prepare an image for the liveness classifier: bounded resize, then global
/// histogram equalization of the luma, replicated back to RGB.
pub fn for_liveness(raw: &RawImage, max_dimension: u32) -> PreprocessedImage {
    let resized = bounded_resize(to_rgb(raw), max_dimension);
    let mut gray = imageops::grayscale(&resized);
    equalize_histogram(&mut gray);
    PreprocessedImage {
        rgb: DynamicImage::ImageLuma8(gray).to_rgb8(),
        source: raw.source(),
        original_width: raw.width(),
        original_height: raw.height(),
    }
}

/// Expand grayscale, drop alpha.
fn to_rgb(raw: &RawImage) -> RgbImage {
    let data = raw.data();
    let channels = raw.channels() as usize;
    let width = raw.width();
    RgbImage::from_fn(width, raw.height(), |x, y| {
        let i = (y as usize * width as usize + x as usize) * channels;
        if channels == 1 {
            Rgb([data[i]; 3])
        } else {
            Rgb([data[i], data[i + 1], data[i + 2]])
        }
    })
}

/// Downscale so the long edge is at most `max_dimension`. Never upscales.
fn bounded_resize(rgb: RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let long_edge = width.max(height);
    if max_dimension == 0 || long_edge <= max_dimension {
        return rgb;
    }

    let scale = max_dimension as f32 / long_edge as f32;
    let new_w = ((width as f32 * scale).round() as u32).max(1);
    let new_h = ((height as f32 * scale).round() as u32).max(1);
    tracing::trace!(width, height, new_w, new_h, "downscaling");
    imageops::resize(&rgb, new_w, new_h, FilterType::Triangle)
}

/// Global histogram equalization in place.
///
/// Maps each level through the normalized CDF so the output spans 0–255.
/// A single-level image is left untouched.
pub fn equalize_histogram(gray: &mut [u8]) {
    if gray.is_empty() {
        return;
    }

    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (level, count) in hist.iter().enumerate() {
        running += count;
        cdf[level] = running;
    }

    let total = gray.len() as u32;
    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
    if total == cdf_min {
        return;
    }

    let denom = (total - cdf_min) as f32;
    let mut lut = [0u8; 256];
    for (level, out) in lut.iter_mut().enumerate() {
        let v = cdf[level].saturating_sub(cdf_min) as f32 / denom * 255.0;
        *out = v.round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}
