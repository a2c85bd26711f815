use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageBuffer, Luma, imageops::FilterType};
use ndarray::Array2;

use crate::config::ResizeQuality;

/// Load an image from disk into memory.
///
/// # Arguments
///
/// * `path` - The path to the image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Map a resize preference onto an `image` sampling filter.
pub fn resize_filter(quality: ResizeQuality) -> FilterType {
    match quality {
        ResizeQuality::Quality => FilterType::Triangle,
        ResizeQuality::Speed => FilterType::Nearest,
    }
}

/// Convert any image into a single grayscale plane with intensities in `[0, 1]`.
///
/// The returned array has shape `(rows, cols)` = `(height, width)`.
pub fn dynamic_to_gray_plane(image: &DynamicImage) -> Array2<f32> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
        gray.get_pixel(col as u32, row as u32)[0] as f32 / 255.0
    })
}

/// Split an image into blue, green and red planes (in that order) with intensities in `[0, 1]`.
pub fn dynamic_to_bgr_planes(image: &DynamicImage) -> [Array2<f32>; 3] {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let shape = (height as usize, width as usize);
    let mut planes = [
        Array2::<f32>::zeros(shape),
        Array2::<f32>::zeros(shape),
        Array2::<f32>::zeros(shape),
    ];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        planes[0][(yi, xi)] = pixel[2] as f32 / 255.0;
        planes[1][(yi, xi)] = pixel[1] as f32 / 255.0;
        planes[2][(yi, xi)] = pixel[0] as f32 / 255.0;
    }
    planes
}

/// Resize a float plane to `(rows, cols)`.
///
/// `image` clamps float samples to `[0, 1]` while filtering, so the plane is mapped into that
/// range first and mapped back afterwards. Both filters only produce convex combinations of the
/// input samples, which keeps the round trip exact up to rounding.
pub fn resize_plane(
    plane: &Array2<f32>,
    rows: usize,
    cols: usize,
    quality: ResizeQuality,
) -> Result<Array2<f32>> {
    anyhow::ensure!(rows > 0 && cols > 0, "target dimensions must be non-zero");
    let (src_rows, src_cols) = plane.dim();
    anyhow::ensure!(
        src_rows > 0 && src_cols > 0,
        "source plane dimensions must be non-zero"
    );
    if (src_rows, src_cols) == (rows, cols) {
        return Ok(plane.clone());
    }

    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = if max > min { max - min } else { 1.0 };

    let unit: Vec<f32> = plane.iter().map(|&v| (v - min) / range).collect();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(src_cols as u32, src_rows as u32, unit)
            .context("plane data does not match its dimensions")?;
    let resized = image::imageops::resize(&buffer, cols as u32, rows as u32, resize_filter(quality));

    let data: Vec<f32> = resized.into_raw().into_iter().map(|v| v * range + min).collect();
    Array2::from_shape_vec((rows, cols), data).context("resized plane has unexpected length")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn gray_plane_is_unit_scaled() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(2, 1, Rgb([255, 255, 255]));
        let plane = dynamic_to_gray_plane(&DynamicImage::ImageRgb8(image));
        assert_eq!(plane.dim(), (2, 3));
        assert_eq!(plane[(0, 0)], 0.0);
        assert!((plane[(1, 2)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bgr_planes_swap_channels() {
        let mut image = RgbImage::new(1, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 51]));
        let [b, g, r] = dynamic_to_bgr_planes(&DynamicImage::ImageRgb8(image));
        assert!((b[(0, 0)] - 0.2).abs() < 1e-6);
        assert_eq!(g[(0, 0)], 0.0);
        assert!((r[(0, 0)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn resize_preserves_constant_planes_outside_unit_range() {
        let plane = Array2::from_elem((8, 6), -3.5f32);
        let resized = resize_plane(&plane, 4, 3, ResizeQuality::Quality).unwrap();
        assert_eq!(resized.dim(), (4, 3));
        assert!(resized.iter().all(|v| (v + 3.5).abs() < 1e-5));
    }

    #[test]
    fn resize_keeps_values_within_input_range() {
        let plane = Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as f32 - 50.0);
        let resized = resize_plane(&plane, 5, 5, ResizeQuality::Quality).unwrap();
        assert!(resized.iter().all(|&v| (-50.0 - 1e-3..=49.0 + 1e-3).contains(&v)));
    }

    #[test]
    fn resize_rejects_empty_target() {
        let plane = Array2::from_elem((2, 2), 1.0f32);
        assert!(resize_plane(&plane, 0, 2, ResizeQuality::Speed).is_err());
    }
}
