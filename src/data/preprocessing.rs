//! Image loading and normalization to the network's input geometry

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use ndarray::Array3;

use crate::error::{Error, Result};
use crate::model::cnn::IMAGE_HEIGHT;

/// Load an image file as a `[max_width, 32, 1]` array with values in `[0, 1]`.
pub fn load_image(path: impl AsRef<Path>, max_width: usize) -> Result<Array3<f32>> {
    let image = image::open(path.as_ref())?;
    preprocess(&image, max_width)
}

/// Scale an image to height 32 and fit it into `max_width` columns.
///
/// Images narrower than `max_width` keep their aspect ratio and are padded with
/// zeros on the right; wider ones are squeezed to exactly `max_width`.
pub fn preprocess(image: &DynamicImage, max_width: usize) -> Result<Array3<f32>> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::data("Image has no pixels"));
    }

    let height_target = IMAGE_HEIGHT as u32;
    let max_width = u32::try_from(max_width)
        .map_err(|_| Error::config(format!("Image width {max_width} is too large")))?;
    let scaled_width = ((width as f64 * height_target as f64 / height as f64).round() as u32).max(1);
    let resized: GrayImage = image::imageops::resize(
        &gray,
        scaled_width.min(max_width),
        height_target,
        FilterType::Triangle,
    );

    let mut array = Array3::<f32>::zeros((max_width as usize, IMAGE_HEIGHT, 1));
    for (x, y, pixel) in resized.enumerate_pixels() {
        array[[x as usize, y as usize, 0]] = f32::from(pixel.0[0]) / 255.0;
    }
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_narrow_image_is_padded() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 64, Luma([255])));
        let array = preprocess(&image, 20).unwrap();
        assert_eq!(array.dim(), (20, IMAGE_HEIGHT, 1));
        // 16x64 scales to 8x32
        assert!((array[[7, 10, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(array[[8, 10, 0]], 0.0);
        assert_eq!(array[[19, 31, 0]], 0.0);
    }

    #[test]
    fn test_wide_image_is_squeezed() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(400, 32, Luma([51])));
        let array = preprocess(&image, 100).unwrap();
        assert_eq!(array.dim(), (100, IMAGE_HEIGHT, 1));
        assert!((array[[99, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ab_1.png");
        GrayImage::from_pixel(10, 32, Luma([0])).save(&path).unwrap();
        let array = load_image(&path, 12).unwrap();
        assert_eq!(array.dim(), (12, IMAGE_HEIGHT, 1));
    }
}
