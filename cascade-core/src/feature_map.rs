//! Feature maps: ordered stacks of equally shaped float planes.

use ndarray::Array2;

use crate::error::CascadeError;

/// A single 2D plane of 32-bit floats, indexed `(row, col)`.
pub type Plane = Array2<f32>;

/// Ordered sequence of planes (one per channel) that all share one shape.
///
/// Every operator produces a fresh `FeatureMap`; none of them modify their input.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    planes: Vec<Plane>,
}

impl FeatureMap {
    /// Build a feature map, rejecting an empty plane list or planes of differing shapes.
    pub fn new(planes: Vec<Plane>) -> Result<Self, CascadeError> {
        let Some(first) = planes.first() else {
            return Err(CascadeError::config("feature map needs at least one plane"));
        };
        let shape = first.dim();
        if let Some((index, plane)) = planes
            .iter()
            .enumerate()
            .find(|(_, plane)| plane.dim() != shape)
        {
            return Err(CascadeError::config(format!(
                "plane {index} has shape {:?} but plane 0 has shape {shape:?}",
                plane.dim()
            )));
        }
        Ok(Self { planes })
    }

    /// Wrap a single plane.
    pub fn from_plane(plane: Plane) -> Self {
        Self {
            planes: vec![plane],
        }
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, channel: usize) -> Option<&Plane> {
        self.planes.get(channel)
    }

    pub fn into_planes(self) -> Vec<Plane> {
        self.planes
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    /// Shared `(rows, cols)` of every plane.
    pub fn dim(&self) -> (usize, usize) {
        self.planes[0].dim()
    }

    /// Values at `(row, col)` across all channels, in channel order.
    pub fn values_at(&self, row: usize, col: usize) -> Vec<f32> {
        self.planes.iter().map(|plane| plane[(row, col)]).collect()
    }

    /// Wrap planes the caller derived shape-for-shape from an existing map.
    pub(crate) fn from_uniform(planes: Vec<Plane>) -> Self {
        debug_assert!(!planes.is_empty());
        debug_assert!(planes.windows(2).all(|pair| pair[0].dim() == pair[1].dim()));
        Self { planes }
    }

    /// Apply `f` to every plane, producing a new map.
    pub(crate) fn map_planes<F>(&self, f: F) -> Result<Self, CascadeError>
    where
        F: FnMut(&Plane) -> Result<Plane, CascadeError>,
    {
        let planes = self.planes.iter().map(f).collect::<Result<Vec<_>, _>>()?;
        FeatureMap::new(planes)
    }
}

impl From<Plane> for FeatureMap {
    fn from(plane: Plane) -> Self {
        FeatureMap::from_plane(plane)
    }
}
