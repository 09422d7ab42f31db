//! Image preparation matching the classifier's training pipeline:
//! center crop (with optional zoom), bilinear resize, scale to [0, 1],
//! per-channel normalization, and HWC to NCHW layout.

use candle_core::{Device, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("invalid preprocess settings: {0}")]
    InvalidSettings(String),
    #[error("pixel buffer holds {got} bytes, expected {expected} for {width}x{height}x{channels}")]
    BadBuffer {
        expected: usize,
        got: usize,
        width: usize,
        height: usize,
        channels: usize,
    },
    #[error("source image {width}x{height} is smaller than the target {target_width}x{target_height}")]
    TooSmall {
        width: usize,
        height: usize,
        target_width: usize,
        target_height: usize,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    /// Shrinks the centered crop window; 1.0 keeps the full centered
    /// square, 2.0 crops the middle half in each direction.
    pub zoom: f32,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
            channels: 3,
            zoom: 1.0,
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessSettings {
    pub fn validate(&self) -> Result<(), PreprocessError> {
        if self.width == 0 || self.height == 0 || self.channels == 0 {
            return Err(PreprocessError::InvalidSettings(
                "width, height and channels must be non-zero".to_string(),
            ));
        }
        if self.zoom < 1.0 {
            return Err(PreprocessError::InvalidSettings(format!(
                "zoom {} must be >= 1.0",
                self.zoom
            )));
        }
        if self.mean.len() != self.channels || self.std.len() != self.channels {
            return Err(PreprocessError::InvalidSettings(format!(
                "mean/std must carry {} entries",
                self.channels
            )));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(PreprocessError::InvalidSettings(
                "std entries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Turn an interleaved 8-bit image into a normalized `(1, C, H, W)`
/// float tensor ready for the exported network.
pub fn prepare_image(
    pixels: &[u8],
    width: usize,
    height: usize,
    settings: &PreprocessSettings,
    device: &Device,
) -> Result<Tensor, PreprocessError> {
    settings.validate()?;
    let channels = settings.channels;
    let expected = width * height * channels;
    if pixels.len() != expected {
        return Err(PreprocessError::BadBuffer {
            expected,
            got: pixels.len(),
            width,
            height,
            channels,
        });
    }
    if width < settings.width || height < settings.height {
        return Err(PreprocessError::TooSmall {
            width,
            height,
            target_width: settings.width,
            target_height: settings.height,
        });
    }

    // Centered square crop, optionally zoomed in.
    let side = (width.min(height) as f32 / settings.zoom).max(1.0);
    let crop_w = side.min(width as f32);
    let crop_h = side.min(height as f32);
    let x0 = (width as f32 - crop_w) / 2.0;
    let y0 = (height as f32 - crop_h) / 2.0;

    let mut chw = vec![0.0f32; channels * settings.height * settings.width];
    let scale_x = crop_w / settings.width as f32;
    let scale_y = crop_h / settings.height as f32;

    for out_y in 0..settings.height {
        let src_y = y0 + (out_y as f32 + 0.5) * scale_y - 0.5;
        let y_lo = src_y.floor().clamp(0.0, (height - 1) as f32) as usize;
        let y_hi = (y_lo + 1).min(height - 1);
        let wy = (src_y - y_lo as f32).clamp(0.0, 1.0);
        for out_x in 0..settings.width {
            let src_x = x0 + (out_x as f32 + 0.5) * scale_x - 0.5;
            let x_lo = src_x.floor().clamp(0.0, (width - 1) as f32) as usize;
            let x_hi = (x_lo + 1).min(width - 1);
            let wx = (src_x - x_lo as f32).clamp(0.0, 1.0);
            for c in 0..channels {
                let at = |y: usize, x: usize| pixels[(y * width + x) * channels + c] as f32;
                let top = at(y_lo, x_lo) * (1.0 - wx) + at(y_lo, x_hi) * wx;
                let bottom = at(y_hi, x_lo) * (1.0 - wx) + at(y_hi, x_hi) * wx;
                let value = (top * (1.0 - wy) + bottom * wy) / 255.0;
                let normalized = (value - settings.mean[c]) / settings.std[c];
                chw[(c * settings.height + out_y) * settings.width + out_x] = normalized;
            }
        }
    }

    Ok(Tensor::from_vec(
        chw,
        (1, channels, settings.height, settings.width),
        device,
    )?)
}
