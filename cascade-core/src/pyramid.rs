//! Image pyramid planning and level resizing.

use cascade_utils::config::{PyramidSettings, ResizeQuality};
use cascade_utils::resize_plane;

use crate::error::CascadeError;
use crate::feature_map::FeatureMap;

/// Controls which face sizes the pyramid covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidConfig {
    /// Fixed input size of the first stage in pixels.
    pub window_size: usize,
    /// Smallest face size, in source pixels, to search for.
    pub min_face_size: f32,
    /// Largest face size to search for; the image's shorter side when `None`.
    pub max_face_size: Option<f32>,
    /// Factor applied to the target face size between levels.
    pub growth_rate: f32,
    /// Resampling used for level and crop resizing.
    pub resize_quality: ResizeQuality,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        PyramidSettings::default().into()
    }
}

impl From<PyramidSettings> for PyramidConfig {
    fn from(settings: PyramidSettings) -> Self {
        Self {
            window_size: settings.window_size as usize,
            min_face_size: settings.min_face_size,
            max_face_size: settings.max_face_size,
            growth_rate: settings.growth_rate,
            resize_quality: settings.resize_quality,
        }
    }
}

impl From<&PyramidSettings> for PyramidConfig {
    fn from(settings: &PyramidSettings) -> Self {
        settings.clone().into()
    }
}

/// One pyramid level: the face size it targets and how the source is resized for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidLevel {
    pub target_size: f32,
    /// `window_size / target_size`; level coordinates divided by this map back to the source.
    pub factor: f32,
    pub rows: usize,
    pub cols: usize,
}

/// Plan the levels for a `rows x cols` source.
///
/// Starting at `min_face_size`, the target grows by `growth_rate` for as long as it stays within
/// the shorter image side and within `max_face_size`.
pub fn pyramid_levels(
    rows: usize,
    cols: usize,
    config: &PyramidConfig,
) -> Result<Vec<PyramidLevel>, CascadeError> {
    if config.window_size == 0 {
        return Err(CascadeError::config("pyramid window size must be positive"));
    }
    if !(config.min_face_size > 0.0) {
        return Err(CascadeError::config(format!(
            "minimum face size must be positive, got {}",
            config.min_face_size
        )));
    }
    if !(config.growth_rate > 1.0) || !config.growth_rate.is_finite() {
        return Err(CascadeError::config(format!(
            "pyramid growth rate must be greater than 1, got {}",
            config.growth_rate
        )));
    }

    let shorter = rows.min(cols) as f32;
    let limit = config.max_face_size.map_or(shorter, |max| max.min(shorter));
    let window = config.window_size as f32;

    let mut levels = Vec::new();
    let mut target = config.min_face_size;
    while target <= limit {
        let factor = window / target;
        levels.push(PyramidLevel {
            target_size: target,
            factor,
            rows: ((rows as f32 * factor).round() as usize).max(1),
            cols: ((cols as f32 * factor).round() as usize).max(1),
        });
        target *= config.growth_rate;
    }
    Ok(levels)
}

/// Resize every channel of `image` to the level's dimensions.
pub fn resize_level(
    image: &FeatureMap,
    level: &PyramidLevel,
    quality: ResizeQuality,
) -> Result<FeatureMap, CascadeError> {
    resize_map(image, level.rows, level.cols, quality)
}

/// Resize every channel of `image` to `rows x cols`.
pub fn resize_map(
    image: &FeatureMap,
    rows: usize,
    cols: usize,
    quality: ResizeQuality,
) -> Result<FeatureMap, CascadeError> {
    image.map_planes(|plane| {
        resize_plane(plane, rows, cols, quality).map_err(|err| {
            CascadeError::geometry(format!(
                "cannot resize {:?} plane to {rows}x{cols}: {err:#}",
                plane.dim()
            ))
        })
    })
}
