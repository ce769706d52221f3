//! Image loading and tensor layout helpers.

use image::{imageops::FilterType, ImageReader, RgbImage};
use std::path::Path;

use crate::config::ImageSize;
use crate::error::ImageLoadError;

/// Decode an image file as RGB, whatever its extension says.
pub fn load_image(path: &Path) -> Result<RgbImage, ImageLoadError> {
    let decode_err = |source| ImageLoadError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let img = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(decode_err)?;
    Ok(img.to_rgb8())
}

/// Resize to the model input size (bilinear), skipping images already at size.
pub fn resize_to(img: RgbImage, size: ImageSize) -> RgbImage {
    let (width, height) = (size.width as u32, size.height as u32);
    if img.dimensions() == (width, height) {
        return img;
    }
    image::imageops::resize(&img, width, height, FilterType::Triangle)
}

/// Flatten to (C, H, W) order with pixel values rescaled to [0, 1].
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// Load an image file, resize it and rescale it by 1/255.
///
/// # Returns
/// - pixel data in (C, H, W) order, `3 * height * width` values
pub fn load_and_rescale(path: &Path, size: ImageSize) -> Result<Vec<f32>, ImageLoadError> {
    let img = resize_to(load_image(path)?, size);
    Ok(to_chw(&img))
}
