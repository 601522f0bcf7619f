use burn::data::dataset::transform::Mapper;
use image::{imageops, Rgb, RgbImage};
use ndarray::{arr2, Array2};
use rand::Rng;

use crate::data::ImageItem;

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentConfig {
    /// Maximum absolute rotation in degrees.
    pub rotation_degrees: f32,
    /// Maximum horizontal shift as a fraction of the width.
    pub width_shift: f32,
    /// Maximum vertical shift as a fraction of the height.
    pub height_shift: f32,
    /// Maximum absolute shear angle in degrees.
    pub shear_degrees: f32,
    /// Zoom factors are drawn from `[1 - zoom, 1 + zoom]` per axis.
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 30.0,
            width_shift: 0.2,
            height_shift: 0.2,
            shear_degrees: 0.2,
            zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

/// One concrete draw from an [`AugmentConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// Rotation in radians.
    pub theta: f32,
    /// Row offset in pixels.
    pub shift_rows: f32,
    /// Column offset in pixels.
    pub shift_cols: f32,
    /// Shear in radians.
    pub shear: f32,
    pub zoom_rows: f32,
    pub zoom_cols: f32,
    pub flip: bool,
}

impl AugmentParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
            flip: false,
        }
    }

    pub fn sample<R: Rng>(config: &AugmentConfig, width: u32, height: u32, rng: &mut R) -> Self {
        let symmetric = |rng: &mut R, limit: f32| {
            if limit > 0.0 {
                rng.gen_range(-limit..=limit)
            } else {
                0.0
            }
        };
        let zoom_range = |rng: &mut R| {
            if config.zoom > 0.0 {
                rng.gen_range(1.0 - config.zoom..=1.0 + config.zoom)
            } else {
                1.0
            }
        };

        Self {
            theta: symmetric(rng, config.rotation_degrees).to_radians(),
            shift_rows: symmetric(rng, config.height_shift) * height as f32,
            shift_cols: symmetric(rng, config.width_shift) * width as f32,
            shear: symmetric(rng, config.shear_degrees).to_radians(),
            zoom_rows: zoom_range(rng),
            zoom_cols: zoom_range(rng),
            flip: config.horizontal_flip && rng.gen_bool(0.5),
        }
    }

    /// Matrix mapping centred output coordinates `(row, col, 1)` to input ones.
    fn matrix(&self) -> Array2<f32> {
        let (sin, cos) = self.theta.sin_cos();
        let rotation = arr2(&[[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]]);
        let shift = arr2(&[
            [1.0, 0.0, self.shift_rows],
            [0.0, 1.0, self.shift_cols],
            [0.0, 0.0, 1.0],
        ]);
        let shear = arr2(&[
            [1.0, -self.shear.sin(), 0.0],
            [0.0, self.shear.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ]);
        let zoom = arr2(&[
            [self.zoom_rows, 0.0, 0.0],
            [0.0, self.zoom_cols, 0.0],
            [0.0, 0.0, 1.0],
        ]);

        rotation.dot(&shift).dot(&shear).dot(&zoom)
    }
}

/// Transform `image` with `params`; pixels mapped from outside the source take
/// the nearest edge pixel.
pub fn apply(image: &RgbImage, params: &AugmentParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let m = params.matrix();
    let center_row = height as f32 / 2.0 - 0.5;
    let center_col = width as f32 / 2.0 - 0.5;

    let transformed = RgbImage::from_fn(width, height, |col, row| {
        let r = row as f32 - center_row;
        let c = col as f32 - center_col;
        let src_row = m[[0, 0]] * r + m[[0, 1]] * c + m[[0, 2]] + center_row;
        let src_col = m[[1, 0]] * r + m[[1, 1]] * c + m[[1, 2]] + center_col;
        sample_bilinear(image, src_row, src_col)
    });

    if params.flip {
        imageops::flip_horizontal(&transformed)
    } else {
        transformed
    }
}

/// Bilinear lookup with coordinates clamped to the image border.
fn sample_bilinear(image: &RgbImage, row: f32, col: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let row = row.clamp(0.0, (height - 1) as f32);
    let col = col.clamp(0.0, (width - 1) as f32);

    let r0 = row.floor() as u32;
    let c0 = col.floor() as u32;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = row - r0 as f32;
    let fc = col - c0 as f32;

    let p00 = image.get_pixel(c0, r0).0;
    let p01 = image.get_pixel(c1, r0).0;
    let p10 = image.get_pixel(c0, r1).0;
    let p11 = image.get_pixel(c1, r1).0;

    let mut out = [0u8; 3];
    for (ch, value) in out.iter_mut().enumerate() {
        let top = p00[ch] as f32 * (1.0 - fc) + p01[ch] as f32 * fc;
        let bottom = p10[ch] as f32 * (1.0 - fc) + p11[ch] as f32 * fc;
        *value = (top * (1.0 - fr) + bottom * fr).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Dataset mapper drawing fresh parameters on every access.
#[derive(Debug, Clone, Default)]
pub struct Augmenter {
    config: AugmentConfig,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> Self {
        Self { config }
    }
}

impl Mapper<ImageItem, ImageItem> for Augmenter {
    fn map(&self, item: &ImageItem) -> ImageItem {
        let (width, height) = item.image.dimensions();
        let params = AugmentParams::sample(&self.config, width, height, &mut rand::thread_rng());

        ImageItem {
            image: apply(&item.image, &params),
            label: item.label,
        }
    }
}
