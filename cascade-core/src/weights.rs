//! Construction of networks from raw weight dumps.
//!
//! A raw weight file is a headerless run of little-endian `f32` values. For every layer that
//! carries weights, in construction order, it holds `output_count * kernel_depth` planes of
//! `kernel_h x kernel_w` (output-major, then depth, then rows, then columns) immediately
//! followed by `output_count` bias values. The reader has to be told every shape up front.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;

use log::debug;

use crate::error::CascadeError;
use crate::feature_map::Plane;
use crate::layer::{CascadeParams, Layer, LayerKind};
use crate::network::Network;

const F32_BYTES: usize = std::mem::size_of::<f32>();
const PREALLOCATE_LIMIT: usize = 1 << 20;

/// Sequential reader over a raw weight stream.
pub struct RawWeightReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> RawWeightReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Read `count` floats.
    ///
    /// The buffer grows with the data actually read, so a short stream fails before an oversized
    /// request allocates.
    pub fn read_floats(&mut self, count: usize) -> Result<Vec<f32>, CascadeError> {
        let length = count
            .checked_mul(F32_BYTES)
            .ok_or_else(|| CascadeError::config(format!("{count} floats overflow a byte count")))?;
        let mut bytes = Vec::with_capacity(length.min(PREALLOCATE_LIMIT));
        let eof = |read: usize| {
            io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {length} byte(s), found {read}"),
            )
        };
        let result = match (&mut self.inner).take(length as u64).read_to_end(&mut bytes) {
            Ok(read) if read == length => Ok(()),
            Ok(read) => Err(eof(read)),
            Err(err) => Err(err),
        };
        result.map_err(|err| {
            CascadeError::io(
                format!(
                    "weight stream ended while reading {count} float(s) at byte {}",
                    self.consumed
                ),
                err,
            )
        })?;
        self.consumed += bytes.len() as u64;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Read `outputs * depth` planes of `rows x cols`, grouped per output.
    pub fn read_planes(
        &mut self,
        outputs: usize,
        depth: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Vec<Plane>, CascadeError> {
        let overflow = || {
            CascadeError::config(format!(
                "{outputs} x {depth} weight planes of {rows}x{cols} overflow a float count"
            ))
        };
        let count = outputs.checked_mul(depth).ok_or_else(overflow)?;
        let area = rows.checked_mul(cols).ok_or_else(overflow)?;
        let values = self.read_floats(count.checked_mul(area).ok_or_else(overflow)?)?;
        if area == 0 {
            return Ok(vec![Plane::zeros((rows, cols)); count]);
        }
        values
            .chunks_exact(area)
            .map(|chunk| {
                Plane::from_shape_vec((rows, cols), chunk.to_vec())
                    .map_err(|err| CascadeError::config(format!("invalid weight plane: {err}")))
            })
            .collect()
    }

    /// Ensure the stream holds nothing beyond what has been read.
    pub fn finish(mut self) -> Result<(), CascadeError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    return Err(CascadeError::config(format!(
                        "weight stream has trailing data after {} byte(s)",
                        self.consumed
                    )));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(CascadeError::io("failed to read weight stream", err)),
            }
        }
    }
}

/// One row of a network construction table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub geometry: CascadeParams,
}

impl LayerSpec {
    pub fn conv(output_count: usize, depth: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            kind: LayerKind::Conv,
            geometry: CascadeParams::conv(output_count, depth, kernel, stride, pad),
        }
    }

    pub fn max_pool(kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            kind: LayerKind::MaxPool,
            geometry: CascadeParams::pool(kernel, stride, pad),
        }
    }

    pub fn fc(output_count: usize, depth: usize, rows: usize, cols: usize) -> Self {
        Self {
            kind: LayerKind::Fc,
            geometry: CascadeParams::fc(output_count, depth, rows, cols),
        }
    }

    pub fn relu() -> Self {
        Self::plain(LayerKind::Relu)
    }

    pub fn softmax() -> Self {
        Self::plain(LayerKind::Softmax)
    }

    pub fn norm() -> Self {
        Self::plain(LayerKind::Norm)
    }

    fn plain(kind: LayerKind) -> Self {
        Self {
            kind,
            geometry: CascadeParams::default(),
        }
    }

    fn build<R: Read>(&self, reader: &mut RawWeightReader<R>) -> Result<Layer, CascadeError> {
        match self.kind {
            LayerKind::Relu | LayerKind::Softmax | LayerKind::Norm => Ok(Layer::new(self.kind)),
            LayerKind::MaxPool => {
                let layer = Layer::with_geometry(self.kind, &self.geometry);
                layer.config()?;
                Ok(layer)
            }
            LayerKind::Conv | LayerKind::Fc => {
                let g = &self.geometry;
                let mut layer = Layer::with_geometry(self.kind, g);
                layer.config()?;
                let weights = reader.read_planes(g.output_count, g.kernel_depth, g.kernel_h, g.kernel_w)?;
                let bias = reader.read_floats(g.output_count)?;
                layer.set_weights(weights, bias)?;
                Ok(layer)
            }
        }
    }
}

/// Build a network from a construction table, pulling weights from `reader` in table order.
///
/// Every byte of the stream must be consumed.
pub fn build_network<R: Read>(
    name: &str,
    specs: &[LayerSpec],
    reader: R,
) -> Result<Network, CascadeError> {
    let mut reader = RawWeightReader::new(reader);
    let mut network = Network::new(name);
    for spec in specs {
        let layer = spec.build(&mut reader)?;
        network.add_layer(layer);
    }
    let consumed = reader.consumed();
    reader.finish()?;
    network.validate()?;
    debug!("Built network {network} from {consumed} weight byte(s)");
    Ok(network)
}

/// [`build_network`] over a weight file on disk.
pub fn build_network_from_file<P: AsRef<Path>>(
    name: &str,
    specs: &[LayerSpec],
    path: P,
) -> Result<Network, CascadeError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        CascadeError::io(format!("failed to open weight file {}", path.display()), err)
    })?;
    build_network(name, specs, BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
        values.into_iter().flat_map(f32::to_le_bytes).collect()
    }

    fn table() -> Vec<LayerSpec> {
        vec![
            LayerSpec::conv(2, 1, 2, 1, 0),
            LayerSpec::max_pool(2, 2, 0),
            LayerSpec::relu(),
            LayerSpec::fc(2, 2, 1, 1),
            LayerSpec::softmax(),
        ]
    }

    fn table_bytes() -> Vec<u8> {
        // conv: 2 planes of 2x2, 2 biases; fc: 4 planes of 1x1, 2 biases.
        floats((0..8).map(|i| i as f32).chain([0.5, -0.5]).chain([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]))
    }

    #[test]
    fn planes_are_output_major() {
        let bytes = floats((0..12).map(|i| i as f32));
        let mut reader = RawWeightReader::new(bytes.as_slice());
        let planes = reader.read_planes(3, 2, 1, 2).unwrap();
        assert_eq!(planes.len(), 6);
        assert_eq!(planes[0][(0, 1)], 1.0);
        assert_eq!(planes[3][(0, 0)], 6.0);
        assert_eq!(reader.consumed(), 48);
        reader.finish().unwrap();
    }

    #[test]
    fn builds_network_in_table_order() {
        let bytes = table_bytes();
        let network = build_network("tiny", &table(), bytes.as_slice()).unwrap();
        assert_eq!(network.len(), 5);
        let conv = network.layer("0.tiny.conv").unwrap();
        assert_eq!(conv.weights()[1][(1, 1)], 7.0);
        assert_eq!(conv.bias(), &[0.5, -0.5]);
        let fc = network.layer("3.tiny.fc").unwrap();
        assert_eq!(fc.weights().len(), 4);
        assert_eq!(fc.bias(), &[0.0, 0.0]);
    }

    #[test]
    fn short_file_is_io_error() {
        let mut bytes = table_bytes();
        bytes.truncate(bytes.len() - 3);
        let err = build_network("tiny", &table(), bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CascadeError::Io { .. }));
    }

    #[test]
    fn trailing_data_is_configuration_error() {
        let mut bytes = table_bytes();
        bytes.extend(floats([9.0]));
        let err = build_network("tiny", &table(), bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));
    }

    #[test]
    fn oversized_table_row_fails_before_reading() {
        let specs = [LayerSpec::conv(usize::MAX, 2, 3, 1, 0)];
        let err = build_network("huge", &specs, floats([1.0]).as_slice()).unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));

        let bytes = floats([1.0]);
        let mut reader = RawWeightReader::new(bytes.as_slice());
        let err = reader.read_planes(usize::MAX, 2, 3, 3).unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)));
        assert_eq!(reader.consumed(), 0);
    }

    #[test]
    fn large_request_on_short_stream_is_io_error() {
        let bytes = floats([1.0, 2.0]);
        let mut reader = RawWeightReader::new(bytes.as_slice());
        let err = reader.read_floats(usize::MAX / 8).unwrap_err();
        assert!(matches!(err, CascadeError::Io { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = build_network_from_file("tiny", &table(), "/nonexistent/weights.bin").unwrap_err();
        assert!(matches!(err, CascadeError::Io { .. }));
    }
}
