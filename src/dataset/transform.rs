//! Image preprocessing and augmentation
//!
//! Both pipelines end the same way: resize to a fixed square resolution and
//! normalize each channel with the ImageNet mean/std the backbone expects.
//! The training pipeline first applies random flips, a small rotation and
//! color jitter, drawing all randomness from a caller-supplied generator.

use burn::config::Config;
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use rand::Rng;

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing configuration
#[derive(Config, Debug, PartialEq)]
pub struct TransformConfig {
    /// Output spatial size (square)
    #[config(default = "224")]
    pub image_size: usize,
    #[config(default = "[0.485, 0.456, 0.406]")]
    pub mean: [f32; 3],
    #[config(default = "[0.229, 0.224, 0.225]")]
    pub std: [f32; 3],
    #[config(default = "0.5")]
    pub hflip_prob: f32,
    #[config(default = "0.5")]
    pub vflip_prob: f32,
    /// Rotation is drawn uniformly from ±rotation_degrees
    #[config(default = "15.0")]
    pub rotation_degrees: f32,
    /// Brightness factor range 1 ± brightness
    #[config(default = "0.2")]
    pub brightness: f32,
    #[config(default = "0.2")]
    pub contrast: f32,
    #[config(default = "0.2")]
    pub saturation: f32,
    /// Hue shift range, as a fraction of a full turn
    #[config(default = "0.1")]
    pub hue: f32,
}

/// A normalized image in CHW layout
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    /// Value at (channel, y, x)
    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.data[channel * self.height * self.width + y * self.width + x]
    }
}

/// Which preprocessing variant a pipeline applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Inference,
    Training,
}

/// Preprocessing pipeline, in either its inference or training variant
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    config: TransformConfig,
    mode: TransformMode,
}

impl TransformPipeline {
    /// Deterministic pipeline: resize and normalize only
    pub fn inference(config: TransformConfig) -> Self {
        Self {
            config,
            mode: TransformMode::Inference,
        }
    }

    /// Stochastic pipeline: augment, then resize and normalize
    pub fn training(config: TransformConfig) -> Self {
        Self {
            config,
            mode: TransformMode::Training,
        }
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Apply this pipeline's variant. The generator is only consulted in training mode.
    pub fn apply<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> ImageTensor {
        match self.mode {
            TransformMode::Inference => self.inference_transform(image),
            TransformMode::Training => self.training_transform(image, rng),
        }
    }

    /// Resize and normalize. Bit-identical output for identical input.
    pub fn inference_transform(&self, image: &RgbImage) -> ImageTensor {
        let size = self.config.image_size as u32;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        to_normalized_tensor(&resized, &self.config.mean, &self.config.std)
    }

    /// Flip, rotate and color-jitter in that order, then resize and normalize
    pub fn training_transform<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> ImageTensor {
        let cfg = &self.config;
        let mut augmented = image.clone();

        if rng.gen::<f32>() < cfg.hflip_prob {
            augmented = imageops::flip_horizontal(&augmented);
        }
        if rng.gen::<f32>() < cfg.vflip_prob {
            augmented = imageops::flip_vertical(&augmented);
        }
        if cfg.rotation_degrees > 0.0 {
            let angle = rng.gen_range(-cfg.rotation_degrees..=cfg.rotation_degrees);
            augmented = rotate(&augmented, angle);
        }

        let jitter = ColorJitter {
            brightness: sample_factor(rng, cfg.brightness),
            contrast: sample_factor(rng, cfg.contrast),
            saturation: sample_factor(rng, cfg.saturation),
            hue_shift: if cfg.hue > 0.0 {
                rng.gen_range(-cfg.hue..=cfg.hue)
            } else {
                0.0
            },
        };
        let augmented = jitter.apply(&augmented);

        self.inference_transform(&augmented)
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::inference(TransformConfig::new())
    }
}

/// Convert an RGB image to a CHW tensor, scaled to [0, 1] then normalized
fn to_normalized_tensor(rgb: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> ImageTensor {
    let (width, height) = rgb.dimensions();
    let num_pixels = (width * height) as usize;

    let mut data = vec![0.0f32; 3 * num_pixels];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * num_pixels + i] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }

    ImageTensor {
        data,
        channels: 3,
        height: height as usize,
        width: width as usize,
    }
}

/// Multiplicative factor drawn from [1 - delta, 1 + delta]
fn sample_factor<R: Rng + ?Sized>(rng: &mut R, delta: f32) -> f32 {
    if delta > 0.0 {
        rng.gen_range((1.0 - delta).max(0.0)..=1.0 + delta)
    } else {
        1.0
    }
}

/// Rotate around the image center with bilinear sampling; uncovered corners are black
fn rotate(img: &RgbImage, angle_degrees: f32) -> RgbImage {
    if angle_degrees.abs() < 0.1 {
        return img.clone();
    }

    let angle_rad = angle_degrees.to_radians();
    let (width, height) = img.dimensions();

    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let cos_a = angle_rad.cos();
    let sin_a = angle_rad.sin();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;

        let src_x = cx + dx * cos_a + dy * sin_a;
        let src_y = cy - dx * sin_a + dy * cos_a;

        bilinear_sample(img, src_x, src_y)
    })
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();

    if x < 0.0 || y < 0.0 || x >= width as f32 - 1.0 || y >= height as f32 - 1.0 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

/// One draw of color jitter parameters
struct ColorJitter {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    hue_shift: f32,
}

impl ColorJitter {
    fn apply(&self, img: &RgbImage) -> RgbImage {
        let (width, height) = img.dimensions();
        let mut pixels: Vec<[f32; 3]> = img
            .pixels()
            .map(|p| {
                [
                    p[0] as f32 / 255.0,
                    p[1] as f32 / 255.0,
                    p[2] as f32 / 255.0,
                ]
            })
            .collect();

        for px in pixels.iter_mut() {
            for v in px.iter_mut() {
                *v = (*v * self.brightness).clamp(0.0, 1.0);
            }
        }

        // Contrast blends towards the mean luminance of the whole image
        let mean = if pixels.is_empty() {
            0.0
        } else {
            pixels.iter().map(luminance).sum::<f32>() / pixels.len() as f32
        };
        for px in pixels.iter_mut() {
            for v in px.iter_mut() {
                *v = (mean + self.contrast * (*v - mean)).clamp(0.0, 1.0);
            }
        }

        for px in pixels.iter_mut() {
            let gray = luminance(px);
            for v in px.iter_mut() {
                *v = (gray + self.saturation * (*v - gray)).clamp(0.0, 1.0);
            }
        }

        if self.hue_shift != 0.0 {
            for px in pixels.iter_mut() {
                let (h, s, v) = rgb_to_hsv(*px);
                *px = hsv_to_rgb((h + self.hue_shift).rem_euclid(1.0), s, v);
            }
        }

        let mut output = RgbImage::new(width, height);
        for (out, px) in output.pixels_mut().zip(pixels.iter()) {
            *out = Rgb([
                (px[0] * 255.0).round().clamp(0.0, 255.0) as u8,
                (px[1] * 255.0).round().clamp(0.0, 255.0) as u8,
                (px[2] * 255.0).round().clamp(0.0, 255.0) as u8,
            ]);
        }
        output
    }
}

fn luminance(px: &[f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

/// RGB in [0, 1] to (hue in [0, 1), saturation, value)
fn rgb_to_hsv([r, g, b]: [f32; 3]) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let h6 = h * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    match sector as i32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}
