//! Visual-legibility enhancement applied before frames reach the oracle.
//!
//! Game Boy frames are tiny (240×160) and low-contrast; upscaling and
//! boosting colour makes them easier for a vision model to read. Nothing
//! downstream branches on the result.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::capture::types::CaptureFrame;
use crate::error::PilotError;

/// Enhancement parameters. Multipliers of `1.0` leave the channel alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    pub enabled: bool,
    /// Integer upscale factor.
    pub scale: u32,
    pub contrast: f32,
    pub saturation: f32,
    pub brightness: f32,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale: 3,
            contrast: 1.5,
            saturation: 1.8,
            brightness: 1.1,
        }
    }
}

/// Upscale with Lanczos3, then apply contrast, saturation and brightness.
pub fn enhance(frame: &CaptureFrame, config: &EnhanceConfig) -> Result<CaptureFrame, PilotError> {
    if !config.enabled {
        return Ok(frame.clone());
    }
    if frame.width() == 0 || frame.height() == 0 {
        return Err(PilotError::Capture("cannot enhance an empty frame".into()));
    }

    let scale = config.scale.max(1);
    let mut image = if scale > 1 {
        imageops::resize(
            frame.image.as_ref(),
            frame.width() * scale,
            frame.height() * scale,
            FilterType::Lanczos3,
        )
    } else {
        frame.image.as_ref().clone()
    };

    adjust_contrast(&mut image, config.contrast);
    adjust_saturation(&mut image, config.saturation);
    adjust_brightness(&mut image, config.brightness);

    let mut enhanced = CaptureFrame::new(image, frame.sequence);
    enhanced.timestamp = frame.timestamp;
    enhanced.captured_at = frame.captured_at;
    enhanced.metadata = frame.metadata.clone();
    enhanced
        .metadata
        .insert("enhanced".into(), format!("x{scale}"));
    Ok(enhanced)
}

fn luma(p: &Rgba<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn clamp_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Blend each pixel away from the image's mean luminance.
fn adjust_contrast(image: &mut RgbaImage, factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }
    let count = (image.width() as f64 * image.height() as f64).max(1.0);
    let mean = (image.pixels().map(|p| luma(p) as f64).sum::<f64>() / count) as f32;
    for p in image.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_channel(mean + (p[c] as f32 - mean) * factor);
        }
    }
}

/// Blend each pixel away from its own grey value.
fn adjust_saturation(image: &mut RgbaImage, factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }
    for p in image.pixels_mut() {
        let grey = luma(p);
        for c in 0..3 {
            p[c] = clamp_channel(grey + (p[c] as f32 - grey) * factor);
        }
    }
}

/// Scale every colour channel.
fn adjust_brightness(image: &mut RgbaImage, factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }
    for p in image.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_channel(p[c] as f32 * factor);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pixels: &[[u8; 4]], w: u32, h: u32) -> CaptureFrame {
        let raw: Vec<u8> = pixels.iter().flatten().copied().collect();
        CaptureFrame::new(RgbaImage::from_raw(w, h, raw).unwrap(), 0)
    }

    #[test]
    fn upscales_by_factor() {
        let f = frame(&[[10, 20, 30, 255]; 6], 3, 2);
        let out = enhance(&f, &EnhanceConfig::default()).unwrap();
        assert_eq!((out.width(), out.height()), (9, 6));
        assert_eq!(out.metadata.get("enhanced").map(String::as_str), Some("x3"));
    }

    #[test]
    fn disabled_is_identity() {
        let f = frame(&[[10, 20, 30, 255]; 4], 2, 2);
        let cfg = EnhanceConfig {
            enabled: false,
            ..Default::default()
        };
        let out = enhance(&f, &cfg).unwrap();
        assert!(out.same_pixels(&f));
    }

    #[test]
    fn neutral_multipliers_keep_colours() {
        let f = frame(&[[10, 20, 30, 255], [200, 100, 50, 255]], 2, 1);
        let cfg = EnhanceConfig {
            enabled: true,
            scale: 1,
            contrast: 1.0,
            saturation: 1.0,
            brightness: 1.0,
        };
        let out = enhance(&f, &cfg).unwrap();
        assert!(out.same_pixels(&f));
    }

    #[test]
    fn contrast_spreads_values() {
        let f = frame(&[[100, 100, 100, 255], [150, 150, 150, 255]], 2, 1);
        let cfg = EnhanceConfig {
            enabled: true,
            scale: 1,
            contrast: 2.0,
            saturation: 1.0,
            brightness: 1.0,
        };
        let out = enhance(&f, &cfg).unwrap();
        assert_eq!(out.image.get_pixel(0, 0)[0], 75);
        assert_eq!(out.image.get_pixel(1, 0)[0], 175);
        assert_eq!(out.image.get_pixel(0, 0)[3], 255);
    }

    #[test]
    fn brightness_saturates_at_white() {
        let f = frame(&[[250, 10, 0, 255]], 1, 1);
        let cfg = EnhanceConfig {
            enabled: true,
            scale: 1,
            contrast: 1.0,
            saturation: 1.0,
            brightness: 1.1,
        };
        let out = enhance(&f, &cfg).unwrap();
        assert_eq!(out.image.get_pixel(0, 0).0, [255, 11, 0, 255]);
    }
}
