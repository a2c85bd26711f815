use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cascade_utils::config::{CascadeSettings, NormalizationMode, StageSettings};
use cascade_utils::{configure_telemetry, dynamic_to_gray_plane, load_image, timing_guard};
use image::DynamicImage;
use log::{debug, info};

use crate::cascade::{EvalOptions, StageThresholds, cascade, filter_detections};
use crate::codec::load_network;
use crate::error::CascadeError;
use crate::feature_map::{FeatureMap, Plane};
use crate::layer::CascadeParams;
use crate::network::Network;
use crate::postprocess::{Detection, back_project, nms};
use crate::pyramid::{PyramidConfig, PyramidLevel, pyramid_levels, resize_level};

/// Per-stage parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageConfig {
    /// Side of the square patch the stage network expects.
    pub input_size: usize,
    pub thresholds: StageThresholds,
    /// IoU threshold applied to the stage's survivors; `None` skips suppression.
    pub nms_threshold: Option<f32>,
    pub normalization: NormalizationMode,
}

impl From<&StageSettings> for StageConfig {
    fn from(settings: &StageSettings) -> Self {
        Self {
            input_size: settings.input_size as usize,
            thresholds: settings.into(),
            nms_threshold: settings.nms_threshold,
            normalization: settings.normalization,
        }
    }
}

/// A stage network with its optional calibration network.
#[derive(Debug, Clone)]
pub struct CascadeStage {
    pub network: Network,
    pub calibration: Option<Network>,
    pub config: StageConfig,
}

/// Pyramid, scan and suppression parameters shared by all stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub pyramid: PyramidConfig,
    pub stride_h: usize,
    pub stride_w: usize,
    /// IoU threshold of the final suppression across pyramid levels.
    pub global_nms_threshold: f32,
    pub parallel: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        (&CascadeSettings::default()).into()
    }
}

impl From<&CascadeSettings> for DetectorConfig {
    fn from(settings: &CascadeSettings) -> Self {
        Self {
            pyramid: (&settings.pyramid).into(),
            stride_h: settings.scan.stride_h as usize,
            stride_w: settings.scan.stride_w as usize,
            global_nms_threshold: settings.global_nms_threshold,
            parallel: settings.parallel,
        }
    }
}

/// What happened on one pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelReport {
    pub level: PyramidLevel,
    /// Detections left after each stage that ran, in stage order.
    pub survivors: Vec<usize>,
}

/// Result of running the cascade on an image.
#[derive(Debug)]
pub struct DetectionOutput {
    /// Final detections in source-image coordinates, highest score first.
    pub detections: Vec<Detection>,
    pub levels: Vec<LevelReport>,
    /// The original `(width, height)` of the input image.
    pub original_size: (u32, u32),
}

/// Multi-stage pyramid face detector.
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    stages: Vec<CascadeStage>,
    config: DetectorConfig,
}

impl CascadeDetector {
    /// Assemble a detector from loaded stages.
    ///
    /// The first stage scans the pyramid, so its input size must equal the pyramid window size.
    pub fn new(stages: Vec<CascadeStage>, config: DetectorConfig) -> Result<Self, CascadeError> {
        let Some(first) = stages.first() else {
            return Err(CascadeError::config("a detector needs at least one stage"));
        };
        if first.config.input_size != config.pyramid.window_size {
            return Err(CascadeError::config(format!(
                "first stage expects {0}x{0} input but the pyramid window is {1}x{1}",
                first.config.input_size, config.pyramid.window_size
            )));
        }
        if config.stride_h == 0 || config.stride_w == 0 {
            return Err(CascadeError::config("scan strides must be greater than zero"));
        }
        if let Some(stage) = stages.iter().find(|stage| stage.config.input_size == 0) {
            return Err(CascadeError::config(format!(
                "stage '{}' has a zero input size",
                stage.network.name()
            )));
        }
        Ok(Self { stages, config })
    }

    /// Load every stage model named in `settings`, resolving relative paths against the
    /// working directory.
    pub fn from_settings(settings: &CascadeSettings) -> Result<Self> {
        Self::from_settings_in(settings, Path::new("."))
    }

    /// Load settings from a JSON file; relative model paths are resolved against the directory
    /// holding that file.
    pub fn from_settings_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = CascadeSettings::load_from_path(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_settings_in(&settings, base)
    }

    fn from_settings_in(settings: &CascadeSettings, base: &Path) -> Result<Self> {
        let _guard = timing_guard("cascade_core::load_models", log::Level::Debug);
        settings.validate()?;
        configure_telemetry(
            settings.telemetry.enabled,
            settings.telemetry.level_filter(),
        );

        let resolve = |model: &str| -> PathBuf {
            let model = Path::new(model);
            if model.is_absolute() {
                model.to_path_buf()
            } else {
                base.join(model)
            }
        };

        let mut stages = Vec::with_capacity(settings.stages.len());
        for (index, stage) in settings.stages.iter().enumerate() {
            let model_path = resolve(&stage.model_path);
            let network = load_network(&model_path).with_context(|| {
                format!("failed to load stage {index} model {}", model_path.display())
            })?;
            let calibration = match &stage.calibration_model_path {
                Some(calibration_path) => {
                    let calibration_path = resolve(calibration_path);
                    Some(load_network(&calibration_path).with_context(|| {
                        format!(
                            "failed to load stage {index} calibration model {}",
                            calibration_path.display()
                        )
                    })?)
                }
                None => None,
            };
            info!(
                "Loaded stage {index}: {} ({} layers){}",
                network.name(),
                network.len(),
                calibration
                    .as_ref()
                    .map(|net| format!(", calibrated by {}", net.name()))
                    .unwrap_or_default()
            );
            stages.push(CascadeStage {
                network,
                calibration,
                config: stage.into(),
            });
        }

        Ok(Self::new(stages, settings.into())?)
    }

    pub fn stages(&self) -> &[CascadeStage] {
        &self.stages
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run detection on an image file path.
    pub fn detect_path<P: AsRef<Path>>(&self, path: P) -> Result<DetectionOutput> {
        let _guard = timing_guard("cascade_core::detect_path", log::Level::Debug);
        let image = load_image(path)?;
        self.detect_image(&image)
    }

    /// Run detection on an in-memory image, converted to a `[0, 1]` grayscale plane.
    pub fn detect_image(&self, image: &DynamicImage) -> Result<DetectionOutput> {
        let plane = dynamic_to_gray_plane(image);
        Ok(self.detect(&plane)?)
    }

    /// Run detection on a single-channel plane.
    pub fn detect(&self, image: &Plane) -> Result<DetectionOutput, CascadeError> {
        self.detect_map(&FeatureMap::from_plane(image.clone()))
    }

    /// Run every stage over every pyramid level of `image`.
    pub fn detect_map(&self, image: &FeatureMap) -> Result<DetectionOutput, CascadeError> {
        let _guard = timing_guard("cascade_core::detect", log::Level::Debug);
        let (rows, cols) = image.dim();
        let levels = pyramid_levels(rows, cols, &self.config.pyramid)?;
        debug!("Scanning {rows}x{cols} image over {} pyramid level(s)", levels.len());

        let mut accumulated = Vec::new();
        let mut reports = Vec::with_capacity(levels.len());
        for (index, level) in levels.iter().enumerate() {
            let _guard = timing_guard(format!("cascade_core::level[{index}]"), log::Level::Trace);
            let survivors = self.run_level(image, level, &mut accumulated)?;
            debug!(
                "Level {index}: face size {:.1}px, factor {:.4}, {}x{} -> survivors per stage {:?}",
                level.target_size, level.factor, level.rows, level.cols, survivors
            );
            reports.push(LevelReport {
                level: *level,
                survivors,
            });
        }

        let detections = {
            let _guard = timing_guard("cascade_core::global_nms", log::Level::Trace);
            nms(accumulated, self.config.global_nms_threshold)
        };
        debug!("{} detection(s) after global suppression", detections.len());

        Ok(DetectionOutput {
            detections,
            levels: reports,
            original_size: (cols as u32, rows as u32),
        })
    }

    fn options(&self, stage: &CascadeStage) -> EvalOptions {
        EvalOptions {
            normalization: stage.config.normalization,
            resize_quality: self.config.pyramid.resize_quality,
            parallel: self.config.parallel,
        }
    }

    fn run_level(
        &self,
        image: &FeatureMap,
        level: &PyramidLevel,
        accumulated: &mut Vec<Detection>,
    ) -> Result<Vec<usize>, CascadeError> {
        let (first, rest) = match self.stages.split_first() {
            Some(split) => split,
            None => return Ok(Vec::new()),
        };

        let mut detections = {
            let _guard = timing_guard("cascade_core::stage[0]", log::Level::Trace);
            let resized = resize_level(image, level, self.config.pyramid.resize_quality)?;
            let window = CascadeParams::window(
                first.config.input_size,
                self.config.stride_h,
                self.config.stride_w,
            );
            let mut found = cascade(
                &resized,
                &window,
                &first.network,
                first.calibration.as_ref(),
                first.config.thresholds,
                &self.options(first),
            )?;
            back_project(&mut found, level.factor);
            match first.config.nms_threshold {
                Some(threshold) => nms(found, threshold),
                None => found,
            }
        };
        let mut survivors = vec![detections.len()];

        for (offset, stage) in rest.iter().enumerate() {
            if detections.is_empty() {
                break;
            }
            let _guard = timing_guard(
                format!("cascade_core::stage[{}]", offset + 1),
                log::Level::Trace,
            );
            let filtered = filter_detections(
                image,
                &detections,
                stage.config.input_size,
                &stage.network,
                stage.calibration.as_ref(),
                stage.config.thresholds,
                &self.options(stage),
            )?;
            detections = match stage.config.nms_threshold {
                Some(threshold) => nms(filtered, threshold),
                None => filtered,
            };
            survivors.push(detections.len());
        }

        accumulated.extend(detections);
        Ok(survivors)
    }
}
