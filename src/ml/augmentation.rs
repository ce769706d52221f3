//! Random geometric augmentation for training images.
//!
//! Each image gets one random affine transform about its centre (rotation,
//! shear, zoom, shift) plus an optional horizontal flip. Uncovered pixels are
//! filled with black.

use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// Rotation range in degrees
    pub rotation_range: f32,
    /// Flip horizontally with probability 0.5
    pub horizontal_flip: bool,
    /// Horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Shear angle range in degrees
    pub shear_range: f32,
    /// Zoom factors are drawn from [1 - zoom_range, 1 + zoom_range]
    pub zoom_range: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            horizontal_flip: true,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageAugmenter {
    config: AugmentationConfig,
}

/// Row-major 3x3 matrix product
fn matmul(a: [f32; 9], b: [f32; 9]) -> [f32; 9] {
    let mut out = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
        }
    }
    out
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl ImageAugmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Draw a random transform and apply it to `img`.
    pub fn augment<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let matrix = self.random_transform(img.width(), img.height(), rng);
        let mut out = match Projection::from_matrix(matrix) {
            Some(projection) => warp(img, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])),
            None => img.clone(),
        };

        if self.config.horizontal_flip && rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(&mut out);
        }
        out
    }

    /// Forward affine matrix: T(centre + shift) * R * Shear * Zoom * T(-centre)
    fn random_transform<R: Rng>(&self, width: u32, height: u32, rng: &mut R) -> [f32; 9] {
        let c = &self.config;
        let theta = symmetric(rng, c.rotation_range).to_radians();
        let shear = symmetric(rng, c.shear_range).to_radians();
        let tx = symmetric(rng, c.width_shift_range) * width as f32;
        let ty = symmetric(rng, c.height_shift_range) * height as f32;
        let (zx, zy) = if c.zoom_range > 0.0 {
            (
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
            )
        } else {
            (1.0, 1.0)
        };

        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        let (sin, cos) = theta.sin_cos();

        let to_origin = [1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0];
        let zoom = [zx, 0.0, 0.0, 0.0, zy, 0.0, 0.0, 0.0, 1.0];
        let shear = [1.0, -shear.sin(), 0.0, 0.0, shear.cos(), 0.0, 0.0, 0.0, 1.0];
        let rotation = [cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0];
        let back = [1.0, 0.0, cx + tx, 0.0, 1.0, cy + ty, 0.0, 0.0, 1.0];

        [zoom, shear, rotation, back]
            .into_iter()
            .fold(to_origin, |acc, m| matmul(m, acc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn identity() -> AugmentationConfig {
        AugmentationConfig {
            rotation_range: 0.0,
            horizontal_flip: false,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
        }
    }

    fn gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 100]))
    }

    #[test]
    fn test_identity_transform_keeps_image() {
        let img = gradient(16);
        let augmenter = ImageAugmenter::new(identity());
        let mut rng = StdRng::seed_from_u64(1);
        let out = augmenter.augment(&img, &mut rng);
        assert_eq!(out.dimensions(), (16, 16));
        assert_eq!(out.get_pixel(5, 7), img.get_pixel(5, 7));
    }

    #[test]
    fn test_augment_keeps_size_and_is_seeded() {
        let img = gradient(24);
        let augmenter = ImageAugmenter::new(AugmentationConfig::default());

        let a = augmenter.augment(&img, &mut StdRng::seed_from_u64(7));
        let b = augmenter.augment(&img, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.dimensions(), img.dimensions());
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_shift_moves_content() {
        let config = AugmentationConfig {
            width_shift_range: 0.5,
            ..identity()
        };
        let augmenter = ImageAugmenter::new(config);
        let img = gradient(16);
        let changed = (0..20u64).any(|seed| {
            augmenter.augment(&img, &mut StdRng::seed_from_u64(seed)) != img
        });
        assert!(changed);
    }

    #[test]
    fn test_matmul_identity() {
        let eye = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let m = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 1.0];
        assert_eq!(matmul(eye, m), m);
        assert_eq!(matmul(m, eye), m);
    }
}
