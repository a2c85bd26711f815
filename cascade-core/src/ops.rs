//! Stateless tensor operators.
//!
//! Single-plane kernels (`conv`, `max_pool`, `relu`) work on one [`Plane`]; the multi-channel
//! operators (`conv_layer`, `max_pool_layer`, `relu_layer`, `softmax`, `fc`, `norm`,
//! `bgr2yuv`) consume and produce [`FeatureMap`]s. Every function allocates its output and
//! leaves its inputs untouched.

use std::ops::Range;

use ndarray::{ArrayView2, Zip, s};

use crate::error::CascadeError;
use crate::feature_map::{FeatureMap, Plane};

/// A horizontal/vertical pair (strides, paddings, kernel sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpatialDims {
    /// Along columns.
    pub horizontal: usize,
    /// Along rows.
    pub vertical: usize,
}

impl SpatialDims {
    pub const fn new(horizontal: usize, vertical: usize) -> Self {
        Self {
            horizontal,
            vertical,
        }
    }

    pub const fn square(value: usize) -> Self {
        Self::new(value, value)
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }
}

/// `floor((size + 2*pad - kernel) / stride) + 1`, or a geometry error when the kernel does not
/// fit the padded input or the padded size overflows.
pub fn output_dim(size: usize, pad: usize, kernel: usize, stride: usize) -> Result<usize, CascadeError> {
    if stride == 0 {
        return Err(CascadeError::geometry("stride must be greater than zero"));
    }
    if kernel == 0 {
        return Err(CascadeError::geometry("kernel must be greater than zero"));
    }
    let padded = pad
        .checked_mul(2)
        .and_then(|both| both.checked_add(size))
        .ok_or_else(|| {
            CascadeError::geometry(format!("input of {size} padded by {pad} overflows"))
        })?;
    let span = padded.checked_sub(kernel).ok_or_else(|| {
        CascadeError::geometry(format!(
            "kernel of {kernel} does not fit input of {size} padded by {pad}"
        ))
    })?;
    Ok(span / stride + 1)
}

/// Check that a `rows x cols` plane of `f32` can be addressed at all.
fn output_shape(rows: usize, cols: usize) -> Result<(usize, usize), CascadeError> {
    match rows.checked_mul(cols) {
        Some(len) if len <= isize::MAX as usize / std::mem::size_of::<f32>() => Ok((rows, cols)),
        _ => Err(CascadeError::geometry(format!(
            "output of {rows}x{cols} is too large"
        ))),
    }
}

/// Overlap of a `kernel`-long window starting at padded offset `start` with the unpadded input
/// of length `size`: the input range and the matching kernel range. `None` when the window only
/// covers padding.
fn overlap(
    start: usize,
    kernel: usize,
    pad: usize,
    size: usize,
) -> Option<(Range<usize>, Range<usize>)> {
    let lo = start.max(pad);
    let hi = (start + kernel).min(pad + size);
    (lo < hi).then(|| (lo - pad..hi - pad, lo - start..hi - start))
}

fn dot(window: ArrayView2<'_, f32>, kernel: ArrayView2<'_, f32>) -> f32 {
    Zip::from(window)
        .and(kernel)
        .fold(0.0f32, |acc, &value, &weight| acc + value * weight)
}

/// Correlate one plane with one kernel.
///
/// The input is zero-padded by `pad` on each side; every output element is the dot product of
/// the kernel with its receptive field plus `bias`.
pub fn conv(
    input: &Plane,
    kernel: &Plane,
    bias: f32,
    stride: SpatialDims,
    pad: SpatialDims,
) -> Result<Plane, CascadeError> {
    let (rows, cols) = input.dim();
    let (kernel_rows, kernel_cols) = kernel.dim();
    let shape = output_shape(
        output_dim(rows, pad.vertical, kernel_rows, stride.vertical)?,
        output_dim(cols, pad.horizontal, kernel_cols, stride.horizontal)?,
    )?;

    // Padding is zero, so only the part of the window over real input contributes.
    Ok(Plane::from_shape_fn(shape, |(row, col)| {
        let vertical = overlap(row * stride.vertical, kernel_rows, pad.vertical, rows);
        let horizontal = overlap(col * stride.horizontal, kernel_cols, pad.horizontal, cols);
        match (vertical, horizontal) {
            (Some((input_rows, weight_rows)), Some((input_cols, weight_cols))) => {
                dot(
                    input.slice(s![input_rows, input_cols]),
                    kernel.slice(s![weight_rows, weight_cols]),
                ) + bias
            }
            _ => bias,
        }
    }))
}

/// Multi-channel convolution.
///
/// Weights are grouped `kernel_depth` planes per output channel: output `o` is the sum over
/// `c` of `conv(input[c], weights[o * kernel_depth + c])` plus `bias[o]`.
pub fn conv_layer(
    input: &FeatureMap,
    weights: &[Plane],
    bias: &[f32],
    kernel_depth: usize,
    stride: SpatialDims,
    pad: SpatialDims,
) -> Result<FeatureMap, CascadeError> {
    if kernel_depth == 0 {
        return Err(CascadeError::config("conv kernel depth must be greater than zero"));
    }
    if input.channels() != kernel_depth {
        return Err(CascadeError::config(format!(
            "conv expects {kernel_depth} input channel(s), got {}",
            input.channels()
        )));
    }
    if bias.len().checked_mul(kernel_depth) != Some(weights.len()) {
        return Err(CascadeError::config(format!(
            "conv has {} weight plane(s) for {} output(s) of depth {kernel_depth}",
            weights.len(),
            bias.len()
        )));
    }

    let mut outputs = Vec::with_capacity(bias.len());
    for (group, &offset) in weights.chunks(kernel_depth).zip(bias) {
        let mut acc: Option<Plane> = None;
        for (channel, kernel) in input.planes().iter().zip(group) {
            let response = conv(channel, kernel, 0.0, stride, pad)?;
            acc = Some(match acc {
                Some(sum) => {
                    if sum.dim() != response.dim() {
                        return Err(CascadeError::config(
                            "conv kernels of one output channel have different shapes",
                        ));
                    }
                    sum + response
                }
                None => response,
            });
        }
        // kernel_depth > 0 guarantees one response per group.
        let summed = acc.ok_or_else(|| CascadeError::config("empty conv kernel group"))?;
        outputs.push(summed + offset);
    }
    FeatureMap::new(outputs)
}

/// Max over every `kernel` window of `input`.
///
/// Padding uses the lowest finite `f32`, so it can only win when a window holds no real value.
pub fn max_pool(
    input: &Plane,
    kernel: SpatialDims,
    stride: SpatialDims,
    pad: SpatialDims,
) -> Result<Plane, CascadeError> {
    let (rows, cols) = input.dim();
    let shape = output_shape(
        output_dim(rows, pad.vertical, kernel.vertical, stride.vertical)?,
        output_dim(cols, pad.horizontal, kernel.horizontal, stride.horizontal)?,
    )?;

    Ok(Plane::from_shape_fn(shape, |(row, col)| {
        let vertical = overlap(row * stride.vertical, kernel.vertical, pad.vertical, rows);
        let horizontal = overlap(col * stride.horizontal, kernel.horizontal, pad.horizontal, cols);
        match (vertical, horizontal) {
            (Some((input_rows, _)), Some((input_cols, _))) => input
                .slice(s![input_rows, input_cols])
                .fold(f32::MIN, |max, &value| max.max(value)),
            _ => f32::MIN,
        }
    }))
}

/// [`max_pool`] applied to every channel.
pub fn max_pool_layer(
    input: &FeatureMap,
    kernel: SpatialDims,
    stride: SpatialDims,
    pad: SpatialDims,
) -> Result<FeatureMap, CascadeError> {
    input.map_planes(|plane| max_pool(plane, kernel, stride, pad))
}

/// Elementwise `max(x, 0)`.
pub fn relu(input: &Plane) -> Plane {
    input.mapv(|value| if value > 0.0 { value } else { 0.0 })
}

/// [`relu`] applied to every channel.
pub fn relu_layer(input: &FeatureMap) -> FeatureMap {
    FeatureMap::from_uniform(input.planes().iter().map(relu).collect())
}

/// Softmax across the channel axis at every spatial position.
///
/// The per-position maximum is subtracted before exponentiation, which makes the result
/// invariant to adding a constant to every channel at a position.
pub fn softmax(input: &FeatureMap) -> FeatureMap {
    let (rows, cols) = input.dim();
    let planes = input.planes();
    let mut outputs: Vec<Plane> = planes.iter().map(|_| Plane::zeros((rows, cols))).collect();

    let mut exps = vec![0.0f32; planes.len()];
    for row in 0..rows {
        for col in 0..cols {
            let max = planes
                .iter()
                .fold(f32::NEG_INFINITY, |max, plane| max.max(plane[(row, col)]));
            let mut sum = 0.0f32;
            for (exp, plane) in exps.iter_mut().zip(planes) {
                *exp = (plane[(row, col)] - max).exp();
                sum += *exp;
            }
            for (output, exp) in outputs.iter_mut().zip(&exps) {
                output[(row, col)] = exp / sum;
            }
        }
    }
    FeatureMap::from_uniform(outputs)
}

/// Fully connected layer: a convolution whose kernel covers the whole input.
///
/// `weights` holds `outputs * channels` planes shaped like the input planes, grouped per output.
/// The result has `outputs` channels of shape `1x1`.
pub fn fc(
    input: &FeatureMap,
    weights: &[Plane],
    bias: &[f32],
    outputs: usize,
) -> Result<FeatureMap, CascadeError> {
    let depth = input.channels();
    if outputs.checked_mul(depth) != Some(weights.len()) {
        return Err(CascadeError::config(format!(
            "fc expects {outputs} output(s) x {depth} channel(s) weight planes, got {}",
            weights.len()
        )));
    }
    if bias.len() != outputs {
        return Err(CascadeError::config(format!(
            "fc expects {outputs} bias value(s), got {}",
            bias.len()
        )));
    }
    if let Some(weight) = weights.iter().find(|weight| weight.dim() != input.dim()) {
        return Err(CascadeError::config(format!(
            "fc weight plane of shape {:?} does not match input shape {:?}",
            weight.dim(),
            input.dim()
        )));
    }

    let planes = weights
        .chunks(depth)
        .zip(bias)
        .map(|(group, &offset)| {
            let sum: f64 = input
                .planes()
                .iter()
                .zip(group)
                .map(|(plane, weight)| f64::from(dot(plane.view(), weight.view())))
                .sum();
            Plane::from_elem((1, 1), (sum + f64::from(offset)) as f32)
        })
        .collect();
    FeatureMap::new(planes)
}

/// Population mean and standard deviation of a plane.
pub fn mean_stdev(plane: &Plane) -> (f32, f32) {
    let count = plane.len().max(1) as f64;
    let mean = plane.iter().map(|&v| f64::from(v)).sum::<f64>() / count;
    let variance = plane
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / count;
    (mean as f32, variance.sqrt() as f32)
}

/// Per-channel normalisation against a reference mean and deviation.
///
/// Each channel becomes `(x - (sample_mean + reference_mean)) * reference_stdev / sample_stdev`,
/// with a zero sample deviation replaced by 1.
pub fn norm(input: &FeatureMap, reference_mean: f32, reference_stdev: f32) -> FeatureMap {
    let planes = input
        .planes()
        .iter()
        .map(|plane| {
            let (mean, stdev) = mean_stdev(plane);
            let stdev = if stdev == 0.0 { 1.0 } else { stdev };
            let shift = mean + reference_mean;
            let scale = reference_stdev / stdev;
            plane.mapv(|value| (value - shift) * scale)
        })
        .collect();
    FeatureMap::from_uniform(planes)
}

/// Standardise each channel with its own mean and deviation.
pub fn norm_global(input: &FeatureMap) -> FeatureMap {
    norm(input, 0.0, 1.0)
}

/// Fixed linear colour transform of a three-channel map.
///
/// The coefficients apply to the channels in stored order `(c0, c1, c2)`:
/// `Y = 0.299 c0 + 0.587 c1 + 0.114 c2`, `U = -0.14713 c0 - 0.28886 c1 + 0.436 c2`,
/// `V = 0.615 c0 - 0.51499 c1 - 0.10001 c2`.
pub fn bgr2yuv(input: &FeatureMap) -> Result<FeatureMap, CascadeError> {
    const COEFFICIENTS: [[f32; 3]; 3] = [
        [0.299, 0.587, 0.114],
        [-0.14713, -0.28886, 0.436],
        [0.615, -0.51499, -0.10001],
    ];
    let [c0, c1, c2] = input.planes() else {
        return Err(CascadeError::config(format!(
            "colour transform expects 3 channels, got {}",
            input.channels()
        )));
    };
    let planes = COEFFICIENTS
        .iter()
        .map(|[a, b, c]| {
            let mut out = Plane::zeros(c0.dim());
            Zip::from(&mut out)
                .and(c0)
                .and(c1)
                .and(c2)
                .for_each(|out, &x, &y, &z| *out = a * x + b * y + c * z);
            out
        })
        .collect();
    FeatureMap::new(planes)
}
