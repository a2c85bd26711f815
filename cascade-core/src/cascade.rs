//! Cascade stages: sliding-window scanning, candidate re-scoring and calibration.
//!
//! These are the building blocks [`CascadeDetector`](crate::detector::CascadeDetector) strings
//! together; they can also be driven directly with hand-built networks.

use std::borrow::Cow;

use cascade_utils::config::{NormalizationMode, ResizeQuality, StageSettings};
use log::trace;
use ndarray::s;
use rayon::prelude::*;

use crate::calibration::{apply_transformation_code, response_bins};
use crate::error::CascadeError;
use crate::feature_map::FeatureMap;
use crate::layer::CascadeParams;
use crate::network::Network;
use crate::ops::norm_global;
use crate::postprocess::{BoundingBox, Detection, PixelRect};
use crate::pyramid::resize_map;

/// Score and calibration cut-offs of one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageThresholds {
    /// A window or candidate survives when its score is strictly above this.
    pub score: f32,
    /// Calibration bins count when their probability is strictly above this.
    pub calibration: f32,
}

impl From<&StageSettings> for StageThresholds {
    fn from(settings: &StageSettings) -> Self {
        Self {
            score: settings.threshold,
            calibration: settings.calibration_threshold,
        }
    }
}

/// How patches are prepared and evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub normalization: NormalizationMode,
    pub resize_quality: ResizeQuality,
    /// Evaluate windows and candidates on the rayon pool.
    pub parallel: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            normalization: NormalizationMode::PerWindow,
            resize_quality: ResizeQuality::Quality,
            parallel: true,
        }
    }
}

/// Score of a stage network output: the `(0, 0)` value of its last channel.
pub fn stage_score(output: &FeatureMap) -> Result<f32, CascadeError> {
    output
        .planes()
        .last()
        .and_then(|plane| plane.get((0, 0)).copied())
        .ok_or_else(|| CascadeError::config("stage network produced an empty output"))
}

/// Top-left corners `(row, col)` of every window that fits entirely inside `rows x cols`.
pub fn window_origins(
    rows: usize,
    cols: usize,
    window: &CascadeParams,
) -> Result<Vec<(usize, usize)>, CascadeError> {
    if window.stride_h == 0 || window.stride_w == 0 {
        return Err(CascadeError::geometry("scan strides must be greater than zero"));
    }
    if window.kernel_h == 0 || window.kernel_w == 0 {
        return Err(CascadeError::geometry("scan window must not be empty"));
    }
    if window.kernel_h > rows || window.kernel_w > cols {
        return Ok(Vec::new());
    }
    let tops = (0..=rows - window.kernel_h).step_by(window.stride_h);
    Ok(tops
        .flat_map(|top| {
            (0..=cols - window.kernel_w)
                .step_by(window.stride_w)
                .map(move |left| (top, left))
        })
        .collect())
}

/// Standardise the whole map once when the mode asks for it.
fn prepare_source(image: &FeatureMap, mode: NormalizationMode) -> Cow<'_, FeatureMap> {
    match mode {
        NormalizationMode::Global => Cow::Owned(norm_global(image)),
        NormalizationMode::PerWindow | NormalizationMode::None => Cow::Borrowed(image),
    }
}

fn normalize_patch(patch: FeatureMap, mode: NormalizationMode) -> FeatureMap {
    match mode {
        NormalizationMode::PerWindow => norm_global(&patch),
        NormalizationMode::Global | NormalizationMode::None => patch,
    }
}

fn cut(image: &FeatureMap, rect: PixelRect) -> FeatureMap {
    let planes = image
        .planes()
        .iter()
        .map(|plane| {
            plane
                .slice(s![rect.y..rect.y + rect.height, rect.x..rect.x + rect.width])
                .to_owned()
        })
        .collect();
    FeatureMap::from_uniform(planes)
}

/// Cut `rect` out of `image`, resize it to `rows x cols` and normalise it per `options`.
///
/// `rect` must lie inside the image.
pub fn extract_patch(
    image: &FeatureMap,
    rect: PixelRect,
    rows: usize,
    cols: usize,
    options: &EvalOptions,
) -> Result<FeatureMap, CascadeError> {
    let (image_rows, image_cols) = image.dim();
    if rect.width == 0
        || rect.height == 0
        || rect.x + rect.width > image_cols
        || rect.y + rect.height > image_rows
    {
        return Err(CascadeError::geometry(format!(
            "patch {rect:?} does not fit a {image_rows}x{image_cols} image"
        )));
    }
    let patch = resize_map(&cut(image, rect), rows, cols, options.resize_quality)?;
    Ok(normalize_patch(patch, options.normalization))
}

/// Map `f` over `items`, on the rayon pool when `parallel` is set; output order matches input
/// order either way.
fn map_ordered<T, U, F>(items: &[T], parallel: bool, f: F) -> Result<Vec<U>, CascadeError>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> Result<U, CascadeError> + Sync + Send,
{
    if parallel {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}

fn scan_prepared(
    source: &FeatureMap,
    window: &CascadeParams,
    net: &Network,
    threshold: f32,
    options: &EvalOptions,
) -> Result<Vec<Detection>, CascadeError> {
    let (rows, cols) = source.dim();
    let origins = window_origins(rows, cols, window)?;
    let hits = map_ordered(&origins, options.parallel, |&(top, left)| {
        let rect = PixelRect {
            x: left,
            y: top,
            width: window.kernel_w,
            height: window.kernel_h,
        };
        let patch = normalize_patch(cut(source, rect), options.normalization);
        let score = stage_score(&net.forward(&patch)?)?;
        Ok((score > threshold).then(|| {
            Detection::new(
                BoundingBox::new(
                    left as f32,
                    top as f32,
                    window.kernel_w as f32,
                    window.kernel_h as f32,
                ),
                score,
            )
        }))
    })?;
    let detections: Vec<Detection> = hits.into_iter().flatten().collect();
    trace!(
        "{}: {} of {} window(s) above {threshold}",
        net.name(),
        detections.len(),
        origins.len()
    );
    Ok(detections)
}

/// Slide `window` over `image` and keep every window whose score exceeds `threshold`.
///
/// Detections are in image coordinates and come back in scan order (row-major by origin).
pub fn scan_windows(
    image: &FeatureMap,
    window: &CascadeParams,
    net: &Network,
    threshold: f32,
    options: &EvalOptions,
) -> Result<Vec<Detection>, CascadeError> {
    let source = prepare_source(image, options.normalization);
    scan_prepared(&source, window, net, threshold, options)
}

fn calibrate_prepared(
    source: &FeatureMap,
    net: &Network,
    detections: &mut [Detection],
    input: (usize, usize),
    threshold: f32,
    options: &EvalOptions,
) -> Result<(), CascadeError> {
    let (rows, cols) = source.dim();
    let adjusted = map_ordered(&*detections, options.parallel, |detection| {
        let mut detection = *detection;
        let Some(rect) = detection.face.to_pixel_rect(cols, rows) else {
            return Ok(detection);
        };
        let patch = extract_patch(source, rect, input.0, input.1, options)?;
        let bins = response_bins(&net.forward(&patch)?)?;
        apply_transformation_code(&mut detection, &bins, threshold);
        Ok(detection)
    })?;
    detections.copy_from_slice(&adjusted);
    Ok(())
}

/// Refine detections in place with a calibration network.
///
/// Each box is cropped from `image`, resized to `input` `(rows, cols)` and classified; boxes
/// that fall entirely outside the image are left as they are.
pub fn calibrate(
    image: &FeatureMap,
    net: &Network,
    detections: &mut [Detection],
    input: (usize, usize),
    threshold: f32,
    options: &EvalOptions,
) -> Result<(), CascadeError> {
    let source = prepare_source(image, options.normalization);
    calibrate_prepared(&source, net, detections, input, threshold, options)
}

/// First cascade stage: [`scan_windows`] followed by optional calibration, both on `image`.
pub fn cascade(
    image: &FeatureMap,
    window: &CascadeParams,
    net: &Network,
    calibration: Option<&Network>,
    thresholds: StageThresholds,
    options: &EvalOptions,
) -> Result<Vec<Detection>, CascadeError> {
    let source = prepare_source(image, options.normalization);
    let mut detections = scan_prepared(&source, window, net, thresholds.score, options)?;
    if let Some(calibration) = calibration {
        calibrate_prepared(
            &source,
            calibration,
            &mut detections,
            (window.kernel_h, window.kernel_w),
            thresholds.calibration,
            options,
        )?;
    }
    Ok(detections)
}

/// Later cascade stage: re-score every candidate at `input_size` and keep those above the
/// threshold with their score replaced, then calibrate the survivors when a network is given.
///
/// Candidates whose box does not overlap the image are dropped.
pub fn filter_detections(
    image: &FeatureMap,
    detections: &[Detection],
    input_size: usize,
    net: &Network,
    calibration: Option<&Network>,
    thresholds: StageThresholds,
    options: &EvalOptions,
) -> Result<Vec<Detection>, CascadeError> {
    let source = prepare_source(image, options.normalization);
    let (rows, cols) = source.dim();
    let rescored = map_ordered(detections, options.parallel, |detection| {
        let Some(rect) = detection.face.to_pixel_rect(cols, rows) else {
            return Ok(None);
        };
        let patch = extract_patch(&source, rect, input_size, input_size, options)?;
        let score = stage_score(&net.forward(&patch)?)?;
        Ok((score > thresholds.score).then_some(Detection::new(detection.face, score)))
    })?;
    let mut survivors: Vec<Detection> = rescored.into_iter().flatten().collect();
    trace!(
        "{}: {} of {} candidate(s) above {}",
        net.name(),
        survivors.len(),
        detections.len(),
        thresholds.score
    );

    if let Some(calibration) = calibration {
        calibrate_prepared(
            &source,
            calibration,
            &mut survivors,
            (input_size, input_size),
            thresholds.calibration,
            options,
        )?;
    }
    Ok(survivors)
}
