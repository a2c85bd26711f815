//! Bounding-box correction from calibration network responses.
//!
//! A calibration network classifies a candidate crop into one of 45 bins, the product of
//! [`SCALES`], [`X_SHIFTS`] and [`Y_SHIFTS`]. Bin `n` stands for scale `n / 9`, x-shift
//! `(n / 3) % 3` and y-shift `n % 3`.

use crate::error::CascadeError;
use crate::feature_map::FeatureMap;
use crate::postprocess::{BoundingBox, Detection};

/// Candidate scale factors.
pub const SCALES: [f32; 5] = [0.83, 0.91, 1.0, 1.10, 1.21];
/// Candidate horizontal shifts as a fraction of the box width.
pub const X_SHIFTS: [f32; 3] = [-0.17, 0.0, 0.17];
/// Candidate vertical shifts as a fraction of the box height.
pub const Y_SHIFTS: [f32; 3] = [-0.17, 0.0, 0.17];
/// Number of bins a calibration response must carry.
pub const BIN_COUNT: usize = SCALES.len() * X_SHIFTS.len() * Y_SHIFTS.len();

/// `(scale, x_shift, y_shift)` represented by bin `n`.
pub fn bin_transform(n: usize) -> (f32, f32, f32) {
    let per_scale = X_SHIFTS.len() * Y_SHIFTS.len();
    (
        SCALES[n / per_scale],
        X_SHIFTS[(n / Y_SHIFTS.len()) % X_SHIFTS.len()],
        Y_SHIFTS[n % Y_SHIFTS.len()],
    )
}

/// Flatten a calibration network output into its bin probabilities.
///
/// Accepts either one `1x1` channel per bin or a single channel holding every bin.
pub fn response_bins(output: &FeatureMap) -> Result<Vec<f32>, CascadeError> {
    let bins = if output.channels() == BIN_COUNT {
        output.values_at(0, 0)
    } else if output.channels() == 1 && output.planes()[0].len() == BIN_COUNT {
        output.planes()[0].iter().copied().collect()
    } else {
        return Err(CascadeError::config(format!(
            "calibration output has {} channel(s) of {:?}, expected {BIN_COUNT} bins",
            output.channels(),
            output.dim()
        )));
    };
    Ok(bins)
}

/// Mean transform over the bins whose probability is strictly above `threshold`.
pub fn mean_transform(response: &[f32], threshold: f32) -> Option<(f32, f32, f32)> {
    let (sum, count) = response
        .iter()
        .take(BIN_COUNT)
        .enumerate()
        .filter(|&(_, &probability)| probability > threshold)
        .fold(((0.0f32, 0.0f32, 0.0f32), 0usize), |((s, x, y), count), (n, _)| {
            let (bs, bx, by) = bin_transform(n);
            ((s + bs, x + bx, y + by), count + 1)
        });
    if count == 0 {
        return None;
    }
    let count = count as f32;
    Some((sum.0 / count, sum.1 / count, sum.2 / count))
}

/// Correct `face` by the averaged transform `(scale, x_shift, y_shift)`.
pub fn adjust_box(face: &BoundingBox, scale: f32, x_shift: f32, y_shift: f32) -> BoundingBox {
    let BoundingBox {
        x,
        y,
        width,
        height,
    } = *face;
    BoundingBox {
        x: x - (x_shift * width) / scale + (scale - 1.0) * width / (2.0 * scale),
        y: y - (y_shift * height) / scale + (scale - 1.0) * height / (2.0 * scale),
        width: width / scale,
        height: height / scale,
    }
}

/// Apply a calibration response to a detection in place.
///
/// The box is left untouched when no bin clears `threshold`; the score never changes.
pub fn apply_transformation_code(detection: &mut Detection, response: &[f32], threshold: f32) {
    if let Some((scale, x_shift, y_shift)) = mean_transform(response, threshold) {
        detection.face = adjust_box(&detection.face, scale, x_shift, y_shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_map::Plane;

    const EPS: f32 = 1e-5;

    fn detection() -> Detection {
        Detection::new(BoundingBox::new(10.0, 20.0, 30.0, 40.0), 0.8)
    }

    #[test]
    fn bins_enumerate_scale_then_x_then_y() {
        assert_eq!(bin_transform(0), (0.83, -0.17, -0.17));
        assert_eq!(bin_transform(1), (0.83, -0.17, 0.0));
        assert_eq!(bin_transform(3), (0.83, 0.0, -0.17));
        assert_eq!(bin_transform(22), (1.0, 0.0, 0.0));
        assert_eq!(bin_transform(44), (1.21, 0.17, 0.17));
    }

    #[test]
    fn uniform_response_at_threshold_leaves_box_unchanged() {
        let p = 1.0 / BIN_COUNT as f32;
        let response = vec![p; BIN_COUNT];
        let mut det = detection();
        apply_transformation_code(&mut det, &response, p);
        assert_eq!(det, detection());
    }

    #[test]
    fn identity_bin_keeps_geometry() {
        let mut response = vec![0.0; BIN_COUNT];
        response[22] = 0.9;
        let mut det = detection();
        apply_transformation_code(&mut det, &response, 0.1);
        assert_eq!(det, detection());
    }

    #[test]
    fn single_bin_moves_and_shrinks() {
        let mut response = vec![0.0; BIN_COUNT];
        // scale 1.10, x-shift 0.17, y-shift -0.17
        response[3 * 9 + 2 * 3] = 0.7;
        let mut det = detection();
        apply_transformation_code(&mut det, &response, 0.5);
        let s = 1.10f32;
        let expected_x = 10.0 - 0.17 * 30.0 / s + (s - 1.0) * 30.0 / (2.0 * s);
        let expected_y = 20.0 + 0.17 * 40.0 / s + (s - 1.0) * 40.0 / (2.0 * s);
        assert!((det.face.x - expected_x).abs() < EPS);
        assert!((det.face.y - expected_y).abs() < EPS);
        assert!((det.face.width - 30.0 / s).abs() < EPS);
        assert!((det.face.height - 40.0 / s).abs() < EPS);
        assert_eq!(det.score, 0.8);
    }

    #[test]
    fn qualifying_bins_are_averaged_without_weights() {
        let mut response = vec![0.0; BIN_COUNT];
        response[0] = 0.2;
        response[44] = 0.9;
        let (scale, x, y) = mean_transform(&response, 0.1).unwrap();
        assert!((scale - (0.83 + 1.21) / 2.0).abs() < EPS);
        assert!(x.abs() < EPS);
        assert!(y.abs() < EPS);
    }

    #[test]
    fn response_accepts_channels_or_single_plane() {
        let channels = FeatureMap::new(vec![Plane::zeros((1, 1)); BIN_COUNT]).unwrap();
        assert_eq!(response_bins(&channels).unwrap().len(), BIN_COUNT);

        let single = FeatureMap::from_plane(Plane::zeros((BIN_COUNT, 1)));
        assert_eq!(response_bins(&single).unwrap().len(), BIN_COUNT);

        let wrong = FeatureMap::new(vec![Plane::zeros((1, 1)); 2]).unwrap();
        assert!(response_bins(&wrong).is_err());
    }
}
