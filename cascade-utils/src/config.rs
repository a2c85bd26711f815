//! Serializable settings for the cascade detector.
//!
//! These structures describe the pyramid, the sliding-window scan and every cascade stage in a
//! form that can be stored as JSON and shared between front ends. The core crate converts them
//! into its own runtime configuration types.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::Path,
    str::FromStr,
};

/// Resize filter preference used when building pyramid levels and stage crops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeQuality {
    /// Area-like smoothing (triangle filter).
    #[default]
    Quality,
    /// Nearest-neighbour sampling.
    Speed,
}

impl fmt::Display for ResizeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResizeQuality::Quality => "quality",
            ResizeQuality::Speed => "speed",
        })
    }
}

impl FromStr for ResizeQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(ResizeQuality::Quality),
            "speed" => Ok(ResizeQuality::Speed),
            other => Err(format!(
                "invalid resize quality '{other}'; expected 'quality' or 'speed'"
            )),
        }
    }
}

/// How a window or crop is standardised before it reaches a stage network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Standardise every window with its own mean and deviation.
    #[default]
    PerWindow,
    /// Standardise the whole pyramid level (or crop) once.
    Global,
    /// Feed raw pixel values.
    None,
}

impl FromStr for NormalizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_window" | "window" => Ok(NormalizationMode::PerWindow),
            "global" => Ok(NormalizationMode::Global),
            "none" => Ok(NormalizationMode::None),
            other => Err(format!("unknown normalization mode '{other}'")),
        }
    }
}

/// Image pyramid parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PyramidSettings {
    /// Input side of the first stage network, in pixels.
    pub window_size: u32,
    /// Smallest face size searched for, in source pixels.
    pub min_face_size: f32,
    /// Largest face size searched for; `None` means the image's shorter side.
    pub max_face_size: Option<f32>,
    /// Multiplier applied to the target face size between levels.
    pub growth_rate: f32,
    /// Resize filter used for pyramid levels and crops.
    pub resize_quality: ResizeQuality,
}

impl Default for PyramidSettings {
    fn default() -> Self {
        Self {
            window_size: 12,
            min_face_size: 48.0,
            max_face_size: None,
            growth_rate: 1.414,
            resize_quality: ResizeQuality::Quality,
        }
    }
}

/// Sliding-window strides for the first stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanSettings {
    /// Vertical step between windows.
    pub stride_h: u32,
    /// Horizontal step between windows.
    pub stride_w: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            stride_h: 4,
            stride_w: 4,
        }
    }
}

/// One cascade stage: a classifier network, an optional calibration network and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageSettings {
    /// Binary model file of the classifier network.
    pub model_path: String,
    /// Binary model file of the calibration network, if this stage calibrates.
    pub calibration_model_path: Option<String>,
    /// Square input side expected by the classifier.
    pub input_size: u32,
    /// Candidates scoring at or below this value are dropped.
    pub threshold: f32,
    /// Calibration bins must exceed this probability to contribute.
    pub calibration_threshold: f32,
    /// IoU threshold for suppression after this stage, if any.
    pub nms_threshold: Option<f32>,
    /// Input standardisation applied before the classifier.
    pub normalization: NormalizationMode,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            model_path: "models/12net.bin".into(),
            calibration_model_path: Some("models/12cnet.bin".into()),
            input_size: 12,
            threshold: 0.5,
            calibration_threshold: 0.1,
            nms_threshold: Some(0.2),
            normalization: NormalizationMode::PerWindow,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether timing logs are emitted.
    pub enabled: bool,
    /// Level for timing logs (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string; unknown values fall back to `Debug`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }
}

/// Complete detector configuration as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeSettings {
    pub pyramid: PyramidSettings,
    pub scan: ScanSettings,
    /// Stages in execution order; the first one scans the pyramid.
    pub stages: Vec<StageSettings>,
    /// IoU threshold for the final suppression across all pyramid levels.
    pub global_nms_threshold: f32,
    /// Evaluate windows and candidates on the rayon thread pool.
    pub parallel: bool,
    pub telemetry: TelemetrySettings,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            pyramid: PyramidSettings::default(),
            scan: ScanSettings::default(),
            stages: default_stages(),
            global_nms_threshold: 0.3,
            parallel: true,
            telemetry: TelemetrySettings::default(),
        }
    }
}

fn default_stages() -> Vec<StageSettings> {
    vec![
        StageSettings::default(),
        StageSettings {
            model_path: "models/24net.bin".into(),
            calibration_model_path: Some("models/24cnet.bin".into()),
            input_size: 24,
            threshold: 1e-7,
            calibration_threshold: 0.1,
            nms_threshold: Some(0.5),
            normalization: NormalizationMode::PerWindow,
        },
        StageSettings {
            model_path: "models/48net.bin".into(),
            calibration_model_path: Some("models/48cnet.bin".into()),
            input_size: 48,
            threshold: 0.1,
            calibration_threshold: 0.1,
            nms_threshold: None,
            normalization: NormalizationMode::PerWindow,
        },
    ]
}

impl CascadeSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: CascadeSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk as pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Reject values the pyramid or scan cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.stages.is_empty(), "at least one cascade stage is required");
        anyhow::ensure!(
            self.pyramid.window_size > 0,
            "pyramid window size must be greater than zero"
        );
        anyhow::ensure!(
            self.pyramid.min_face_size > 0.0,
            "minimum face size must be greater than zero"
        );
        anyhow::ensure!(
            self.pyramid.growth_rate > 1.0,
            "pyramid growth rate must be greater than 1 (got {})",
            self.pyramid.growth_rate
        );
        anyhow::ensure!(
            self.scan.stride_h > 0 && self.scan.stride_w > 0,
            "scan strides must be greater than zero"
        );
        for (index, stage) in self.stages.iter().enumerate() {
            anyhow::ensure!(
                stage.input_size > 0,
                "stage {index} input size must be greater than zero"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = CascadeSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = CascadeSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.pyramid, settings.pyramid);
        assert_eq!(loaded.scan, settings.scan);
        assert_eq!(loaded.stages, settings.stages);
        assert_eq!(loaded.global_nms_threshold, settings.global_nms_threshold);
        assert_eq!(loaded.parallel, settings.parallel);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "pyramid": { "min_face_size": 24.0, "resize_quality": "speed" },
            "stages": [ { "model_path": "nets/a.bin", "threshold": 0.7 } ]
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = CascadeSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.pyramid.min_face_size, 24.0);
        assert_eq!(loaded.pyramid.window_size, 12);
        assert_eq!(loaded.pyramid.resize_quality, ResizeQuality::Speed);
        assert_eq!(loaded.stages.len(), 1);
        assert_eq!(loaded.stages[0].model_path, "nets/a.bin");
        assert_eq!(loaded.stages[0].threshold, 0.7);
        assert_eq!(loaded.stages[0].input_size, 12);
        assert_eq!(loaded.scan.stride_w, 4);
        assert!(!loaded.telemetry.enabled);
        assert_eq!(loaded.telemetry.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn rejects_empty_stage_list() {
        let file = NamedTempFile::new().expect("tempfile");
        fs::write(file.path(), r#"{ "stages": [] }"#).expect("write settings");
        let err = CascadeSettings::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("at least one cascade stage"));
    }

    #[test]
    fn parses_mode_strings() {
        assert_eq!("Speed".parse::<ResizeQuality>(), Ok(ResizeQuality::Speed));
        assert!("fast".parse::<ResizeQuality>().is_err());
        assert_eq!(
            "per-window".parse::<NormalizationMode>(),
            Ok(NormalizationMode::PerWindow)
        );
        assert_eq!("GLOBAL".parse::<NormalizationMode>(), Ok(NormalizationMode::Global));
    }
}
