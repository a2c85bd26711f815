//! Layer descriptions: a kind tag, a string-keyed parameter map, and owned weights.
//!
//! The parameter map is kept for the persisted model format. Execution goes through
//! [`Layer::config`], which resolves the map into a typed [`LayerConfig`] once per call and
//! reports missing or malformed keys as configuration errors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CascadeError;
use crate::feature_map::Plane;
use crate::ops::SpatialDims;

/// Parameter keys understood by the layer kinds.
pub mod keys {
    pub const PAD_H: &str = "padH";
    pub const PAD_W: &str = "padW";
    pub const STRIDE_H: &str = "strideH";
    pub const STRIDE_W: &str = "strideW";
    pub const KERNEL_H: &str = "kernelH";
    pub const KERNEL_W: &str = "kernelW";
    pub const KERNEL_DEPTH: &str = "kernelDepth";
    pub const OUTPUT_COUNT: &str = "outputCount";
    pub const MEAN: &str = "mean";
    pub const STDEV: &str = "stdev";
}

/// Closed set of operators a layer can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Conv,
    Relu,
    MaxPool,
    Softmax,
    Fc,
    Norm,
}

impl LayerKind {
    pub const ALL: [LayerKind; 6] = [
        LayerKind::Conv,
        LayerKind::Relu,
        LayerKind::MaxPool,
        LayerKind::Softmax,
        LayerKind::Fc,
        LayerKind::Norm,
    ];

    /// Type string used in layer names and model files.
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Conv => "conv",
            LayerKind::Relu => "relu",
            LayerKind::MaxPool => "maxpool",
            LayerKind::Softmax => "softmax",
            LayerKind::Fc => "fc",
            LayerKind::Norm => "norm",
        }
    }

    /// Whether the kind carries weights and biases.
    pub fn has_weights(self) -> bool {
        matches!(self, LayerKind::Conv | LayerKind::Fc)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CascadeError::config(format!("unknown layer type '{s}'")))
    }
}

/// Window geometry shared by layer construction and sliding-window scanning.
///
/// `h` fields run along rows, `w` fields along columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeParams {
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub kernel_depth: usize,
    pub output_count: usize,
}

impl CascadeParams {
    /// Square window scanned with the given strides.
    pub fn window(size: usize, stride_h: usize, stride_w: usize) -> Self {
        Self {
            stride_h,
            stride_w,
            kernel_h: size,
            kernel_w: size,
            ..Self::default()
        }
    }

    /// Convolution geometry: `output_count` kernels of `kernel x kernel x depth`.
    pub fn conv(output_count: usize, depth: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            pad_h: pad,
            pad_w: pad,
            stride_h: stride,
            stride_w: stride,
            kernel_h: kernel,
            kernel_w: kernel,
            kernel_depth: depth,
            output_count,
        }
    }

    /// Square pooling window.
    pub fn pool(kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            pad_h: pad,
            pad_w: pad,
            stride_h: stride,
            stride_w: stride,
            kernel_h: kernel,
            kernel_w: kernel,
            ..Self::default()
        }
    }

    /// Fully connected geometry over a `rows x cols x depth` input.
    pub fn fc(output_count: usize, depth: usize, rows: usize, cols: usize) -> Self {
        Self {
            stride_h: 1,
            stride_w: 1,
            kernel_h: rows,
            kernel_w: cols,
            kernel_depth: depth,
            output_count,
            ..Self::default()
        }
    }

    pub fn stride(&self) -> SpatialDims {
        SpatialDims::new(self.stride_w, self.stride_h)
    }

    pub fn pad(&self) -> SpatialDims {
        SpatialDims::new(self.pad_w, self.pad_h)
    }

    pub fn kernel(&self) -> SpatialDims {
        SpatialDims::new(self.kernel_w, self.kernel_h)
    }

    /// The eight geometry entries in parameter-map form.
    pub fn to_param_map(&self) -> BTreeMap<String, f32> {
        [
            (keys::PAD_H, self.pad_h),
            (keys::PAD_W, self.pad_w),
            (keys::STRIDE_H, self.stride_h),
            (keys::STRIDE_W, self.stride_w),
            (keys::KERNEL_H, self.kernel_h),
            (keys::KERNEL_W, self.kernel_w),
            (keys::KERNEL_DEPTH, self.kernel_depth),
            (keys::OUTPUT_COUNT, self.output_count),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value as f32))
        .collect()
    }

    /// Read all eight geometry entries; any missing key is an error.
    pub fn from_param_map(params: &BTreeMap<String, f32>) -> Result<Self, CascadeError> {
        let get = |key: &str| {
            params
                .get(key)
                .copied()
                .ok_or_else(|| CascadeError::config(format!("missing parameter '{key}'")))
                .and_then(|value| to_count(key, value))
        };
        Ok(Self {
            pad_h: get(keys::PAD_H)?,
            pad_w: get(keys::PAD_W)?,
            stride_h: get(keys::STRIDE_H)?,
            stride_w: get(keys::STRIDE_W)?,
            kernel_h: get(keys::KERNEL_H)?,
            kernel_w: get(keys::KERNEL_W)?,
            kernel_depth: get(keys::KERNEL_DEPTH)?,
            output_count: get(keys::OUTPUT_COUNT)?,
        })
    }
}

/// Largest geometry value a parameter map may carry.
pub const MAX_GEOMETRY_VALUE: usize = i32::MAX as usize;

fn to_count(key: &str, value: f32) -> Result<usize, CascadeError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(CascadeError::config(format!(
            "parameter '{key}' must be a non-negative integer, got {value}"
        )));
    }
    if f64::from(value) > MAX_GEOMETRY_VALUE as f64 {
        return Err(CascadeError::config(format!(
            "parameter '{key}' is out of range: {value} exceeds {MAX_GEOMETRY_VALUE}"
        )));
    }
    Ok(value as usize)
}

/// Resolved per-kind configuration used by the forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerConfig {
    Conv {
        kernel_depth: usize,
        output_count: usize,
        stride: SpatialDims,
        pad: SpatialDims,
    },
    Relu,
    MaxPool {
        kernel: SpatialDims,
        stride: SpatialDims,
        pad: SpatialDims,
    },
    Softmax,
    Fc {
        output_count: usize,
    },
    Norm {
        mean: f32,
        stdev: f32,
    },
}

/// One operator instance inside a [`Network`](crate::network::Network).
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    kind: LayerKind,
    params: BTreeMap<String, f32>,
    weights: Vec<Plane>,
    bias: Vec<f32>,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
            weights: Vec::new(),
            bias: Vec::new(),
        }
    }

    /// A layer whose parameter map holds the given geometry.
    pub fn with_geometry(kind: LayerKind, geometry: &CascadeParams) -> Self {
        let mut layer = Self::new(kind);
        layer.set_params(geometry);
        layer
    }

    /// Reassemble a layer from decoded parts without validating them.
    pub fn from_parts(
        kind: LayerKind,
        params: BTreeMap<String, f32>,
        weights: Vec<Plane>,
        bias: Vec<f32>,
    ) -> Self {
        Self {
            kind,
            params,
            weights,
            bias,
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn params(&self) -> &BTreeMap<String, f32> {
        &self.params
    }

    pub fn weights(&self) -> &[Plane] {
        &self.weights
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: f32) -> &mut Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Overwrite the eight geometry entries.
    pub fn set_params(&mut self, geometry: &CascadeParams) -> &mut Self {
        self.params.extend(geometry.to_param_map());
        self
    }

    /// Required parameter lookup.
    pub fn param(&self, key: &str) -> Result<f32, CascadeError> {
        self.params.get(key).copied().ok_or_else(|| {
            CascadeError::config(format!("{} layer is missing parameter '{key}'", self.kind))
        })
    }

    pub fn param_or(&self, key: &str, default: f32) -> f32 {
        self.params.get(key).copied().unwrap_or(default)
    }

    fn count(&self, key: &str) -> Result<usize, CascadeError> {
        to_count(key, self.param(key)?)
    }

    fn dims(&self, horizontal: &str, vertical: &str) -> Result<SpatialDims, CascadeError> {
        Ok(SpatialDims::new(self.count(horizontal)?, self.count(vertical)?))
    }

    /// Assign weights and biases, checking them against the declared geometry.
    pub fn set_weights(&mut self, weights: Vec<Plane>, bias: Vec<f32>) -> Result<(), CascadeError> {
        let previous_weights = std::mem::replace(&mut self.weights, weights);
        let previous_bias = std::mem::replace(&mut self.bias, bias);
        if let Err(err) = self.check_weights() {
            self.weights = previous_weights;
            self.bias = previous_bias;
            return Err(err);
        }
        Ok(())
    }

    /// Resolve the parameter map into the typed configuration for this kind.
    pub fn config(&self) -> Result<LayerConfig, CascadeError> {
        Ok(match self.kind {
            LayerKind::Conv => LayerConfig::Conv {
                kernel_depth: self.count(keys::KERNEL_DEPTH)?,
                output_count: self.count(keys::OUTPUT_COUNT)?,
                stride: self.dims(keys::STRIDE_W, keys::STRIDE_H)?,
                pad: self.dims(keys::PAD_W, keys::PAD_H)?,
            },
            LayerKind::Relu => LayerConfig::Relu,
            LayerKind::MaxPool => LayerConfig::MaxPool {
                kernel: self.dims(keys::KERNEL_W, keys::KERNEL_H)?,
                stride: self.dims(keys::STRIDE_W, keys::STRIDE_H)?,
                pad: self.dims(keys::PAD_W, keys::PAD_H)?,
            },
            LayerKind::Softmax => LayerConfig::Softmax,
            LayerKind::Fc => LayerConfig::Fc {
                output_count: self.count(keys::OUTPUT_COUNT)?,
            },
            LayerKind::Norm => LayerConfig::Norm {
                mean: self.param_or(keys::MEAN, 0.0),
                stdev: self.param_or(keys::STDEV, 1.0),
            },
        })
    }

    /// Full consistency check: parameters resolve and weight counts match them.
    pub fn validate(&self) -> Result<(), CascadeError> {
        self.config()?;
        self.check_weights()
    }

    fn check_weights(&self) -> Result<(), CascadeError> {
        if !self.kind.has_weights() {
            if self.weights.is_empty() && self.bias.is_empty() {
                return Ok(());
            }
            return Err(CascadeError::config(format!(
                "{} layer cannot carry weights or biases",
                self.kind
            )));
        }

        let outputs = self.count(keys::OUTPUT_COUNT)?;
        let depth = self.count(keys::KERNEL_DEPTH)?;
        let planes = outputs.checked_mul(depth).ok_or_else(|| {
            CascadeError::config(format!(
                "{} layer declares {outputs} output(s) x depth {depth}, which overflows",
                self.kind
            ))
        })?;
        if self.weights.len() != planes {
            return Err(CascadeError::config(format!(
                "{} layer declares {outputs} output(s) x depth {depth} but holds {} weight plane(s)",
                self.kind,
                self.weights.len()
            )));
        }
        if self.bias.len() != outputs {
            return Err(CascadeError::config(format!(
                "{} layer declares {outputs} output(s) but holds {} bias value(s)",
                self.kind,
                self.bias.len()
            )));
        }

        let expected = match (self.params.get(keys::KERNEL_H), self.params.get(keys::KERNEL_W)) {
            (Some(&rows), Some(&cols)) => {
                Some((to_count(keys::KERNEL_H, rows)?, to_count(keys::KERNEL_W, cols)?))
            }
            _ => self.weights.first().map(|plane| plane.dim()),
        };
        let Some(shape) = expected else {
            return Ok(());
        };
        match self.weights.iter().find(|plane| plane.dim() != shape) {
            Some(plane) => Err(CascadeError::config(format!(
                "{} layer weight plane has shape {:?}, expected {shape:?}",
                self.kind,
                plane.dim()
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for kind in LayerKind::ALL {
            assert_eq!(kind.as_str().parse::<LayerKind>().unwrap(), kind);
        }
        let err = "dropout".parse::<LayerKind>().unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));
    }

    #[test]
    fn geometry_survives_param_map() {
        let geometry = CascadeParams::conv(16, 3, 3, 1, 1);
        let map = geometry.to_param_map();
        assert_eq!(map.len(), 8);
        assert_eq!(map[keys::OUTPUT_COUNT], 16.0);
        assert_eq!(CascadeParams::from_param_map(&map).unwrap(), geometry);
    }

    #[test]
    fn missing_parameter_is_configuration_error() {
        let mut layer = Layer::new(LayerKind::MaxPool);
        layer.set_param(keys::KERNEL_H, 3.0);
        let err = layer.config().unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));
    }

    #[test]
    fn fractional_geometry_is_rejected() {
        let mut layer = Layer::with_geometry(LayerKind::MaxPool, &CascadeParams::pool(3, 2, 0));
        layer.set_param(keys::STRIDE_W, 1.5);
        assert!(layer.config().is_err());
    }

    #[test]
    fn oversized_geometry_is_rejected() {
        let mut params = CascadeParams::conv(2, 2, 3, 1, 0).to_param_map();
        params.insert(keys::OUTPUT_COUNT.to_string(), 1e30);
        let layer = Layer::from_parts(LayerKind::Conv, params.clone(), Vec::new(), Vec::new());
        assert!(matches!(layer.validate(), Err(CascadeError::Configuration(_))));
        assert!(CascadeParams::from_param_map(&params).is_err());

        let mut layer = Layer::with_geometry(LayerKind::MaxPool, &CascadeParams::pool(2, 1, 0));
        layer.set_param(keys::PAD_H, 1e30);
        assert!(matches!(layer.config(), Err(CascadeError::Configuration(_))));
        layer.set_param(keys::PAD_H, MAX_GEOMETRY_VALUE as f32 * 4.0);
        assert!(layer.config().is_err());
    }

    #[test]
    fn conv_config_maps_w_to_horizontal() {
        let mut geometry = CascadeParams::conv(2, 1, 3, 1, 0);
        geometry.stride_w = 2;
        geometry.pad_h = 1;
        let layer = Layer::with_geometry(LayerKind::Conv, &geometry);
        match layer.config().unwrap() {
            LayerConfig::Conv { stride, pad, .. } => {
                assert_eq!(stride, SpatialDims::new(2, 1));
                assert_eq!(pad, SpatialDims::new(0, 1));
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn set_weights_checks_counts_and_keeps_previous_on_error() {
        let mut layer = Layer::with_geometry(LayerKind::Conv, &CascadeParams::conv(2, 1, 3, 1, 0));
        layer
            .set_weights(vec![Plane::zeros((3, 3)); 2], vec![0.0, 1.0])
            .expect("matching weights");
        assert_eq!(layer.weights().len(), 2);

        let err = layer
            .set_weights(vec![Plane::zeros((3, 3)); 3], vec![0.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));
        assert_eq!(layer.weights().len(), 2);

        assert!(
            layer
                .set_weights(vec![Plane::zeros((2, 2)); 2], vec![0.0, 1.0])
                .is_err()
        );
    }

    #[test]
    fn norm_defaults_to_pure_standardisation() {
        let mut layer = Layer::new(LayerKind::Norm);
        assert_eq!(
            layer.config().unwrap(),
            LayerConfig::Norm {
                mean: 0.0,
                stdev: 1.0
            }
        );
        layer.set_param(keys::STDEV, 2.0);
        assert_eq!(
            layer.config().unwrap(),
            LayerConfig::Norm {
                mean: 0.0,
                stdev: 2.0
            }
        );
    }

    #[test]
    fn weightless_kinds_reject_weights() {
        let mut layer = Layer::new(LayerKind::Relu);
        assert!(layer.set_weights(vec![Plane::zeros((1, 1))], vec![0.0]).is_err());
        assert!(layer.validate().is_ok());
    }
}
