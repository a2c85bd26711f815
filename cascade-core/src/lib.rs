//! Cascade CNN face detection.
//!
//! This crate runs small convolutional networks on a hand-written CPU engine, reads and writes
//! them in a compact binary format, and chains them into a multi-stage pyramid detector with
//! box calibration and non-maximum suppression.

/// Bounding-box correction from calibration network responses.
pub mod calibration;
/// Sliding-window scanning and candidate re-scoring.
pub mod cascade;
/// Binary model persistence.
pub mod codec;
/// High-level multi-stage detection runner.
pub mod detector;
/// Error type shared by every core operation.
pub mod error;
/// Stacks of equally shaped float planes.
pub mod feature_map;
/// Layer kinds, geometry and parameters.
pub mod layer;
/// Ordered layer pipelines.
pub mod network;
/// Tensor operators.
pub mod ops;
/// Boxes, suppression and back-projection.
pub mod postprocess;
/// Image pyramid planning.
pub mod pyramid;
/// Network construction from raw weight dumps.
pub mod weights;

pub use calibration::apply_transformation_code;
pub use cascade::{
    EvalOptions, StageThresholds, calibrate, cascade, extract_patch, filter_detections,
    scan_windows, stage_score,
};
pub use codec::{Decode, Encode, from_bytes, load_network, save_network, to_bytes};
pub use detector::{
    CascadeDetector, CascadeStage, DetectionOutput, DetectorConfig, LevelReport, StageConfig,
};
pub use error::CascadeError;
pub use feature_map::{FeatureMap, Plane};
pub use layer::{CascadeParams, Layer, LayerConfig, LayerKind};
pub use network::Network;
pub use ops::SpatialDims;
pub use postprocess::{BoundingBox, Detection, PixelRect, back_project, nms};
pub use pyramid::{PyramidConfig, PyramidLevel, pyramid_levels};
pub use weights::{LayerSpec, RawWeightReader, build_network, build_network_from_file};
