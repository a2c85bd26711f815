//! Binary model persistence.
//!
//! Layout, all little-endian:
//!
//! * scalars: their raw bytes (`u64`, `i32`, `f32`);
//! * strings: `u64` byte length followed by UTF-8 bytes;
//! * sequences: `u64` element count followed by each element;
//! * maps: `u64` entry count followed by key/value pairs in ascending key order;
//! * planes: `i32` rows, `i32` cols, `i32` element tag ([`PLANE_F32_TAG`]), row-major `f32` data;
//! * layers: type string, weight planes, bias floats, parameter map;
//! * networks: name, layers, layer names in execution order, name to index map.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::CascadeError;
use crate::feature_map::Plane;
use crate::layer::{Layer, LayerKind};
use crate::network::Network;

/// Element tag written for 32-bit float planes.
pub const PLANE_F32_TAG: i32 = 5;

/// Capacity reserved up front for decoded sequences, whatever count the stream claims.
const MAX_PREALLOCATION: usize = 4096;

/// Types with a binary encoding.
pub trait Encode {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

/// Types that can be read back from their binary encoding.
pub trait Decode: Sized {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError>;
}

fn read_array<const N: usize, R: Read>(reader: &mut R, what: &str) -> Result<[u8; N], CascadeError> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|err| CascadeError::io(format!("failed to read {what}"), err))?;
    Ok(buf)
}

fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize, CascadeError> {
    let count = u64::from_le_bytes(read_array(reader, what)?);
    usize::try_from(count)
        .map_err(|_| CascadeError::config(format!("{what} of {count} does not fit in memory")))
}

impl Encode for u64 {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

impl Decode for u64 {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        Ok(u64::from_le_bytes(read_array(reader, "u64")?))
    }
}

impl Encode for i32 {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

impl Decode for i32 {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        Ok(i32::from_le_bytes(read_array(reader, "i32")?))
    }
}

impl Encode for f32 {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

impl Decode for f32 {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        Ok(f32::from_le_bytes(read_array(reader, "f32")?))
    }
}

impl Encode for String {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        (self.len() as u64).encode(writer)?;
        writer.write_all(self.as_bytes())
    }
}

impl Decode for String {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let len = read_len(reader, "string length")?;
        let mut bytes = Vec::with_capacity(len.min(MAX_PREALLOCATION));
        reader
            .by_ref()
            .take(len as u64)
            .read_to_end(&mut bytes)
            .map_err(|err| CascadeError::io("failed to read string bytes", err))?;
        if bytes.len() != len {
            return Err(CascadeError::io(
                "failed to read string bytes",
                io::Error::from(io::ErrorKind::UnexpectedEof),
            ));
        }
        String::from_utf8(bytes)
            .map_err(|err| CascadeError::config(format!("string is not valid UTF-8: {err}")))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        encode_slice(self, writer)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let count = read_len(reader, "sequence length")?;
        let mut items = Vec::with_capacity(count.min(MAX_PREALLOCATION));
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        (self.len() as u64).encode(writer)?;
        for (key, value) in self {
            key.encode(writer)?;
            value.encode(writer)?;
        }
        Ok(())
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let count = read_len(reader, "map length")?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(reader)?;
            let value = V::decode(reader)?;
            if map.insert(key, value).is_some() {
                return Err(CascadeError::config("map contains a duplicate key"));
            }
        }
        Ok(map)
    }
}

impl Encode for Plane {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let (rows, cols) = self.dim();
        let to_i32 = |value: usize| {
            i32::try_from(value)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "plane is too large"))
        };
        to_i32(rows)?.encode(writer)?;
        to_i32(cols)?.encode(writer)?;
        PLANE_F32_TAG.encode(writer)?;
        // `iter` walks in logical row-major order whatever the memory layout.
        self.iter().try_for_each(|value| value.encode(writer))
    }
}

impl Decode for Plane {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let rows = i32::decode(reader)?;
        let cols = i32::decode(reader)?;
        let tag = i32::decode(reader)?;
        if tag != PLANE_F32_TAG {
            return Err(CascadeError::config(format!(
                "plane element tag {tag} is not the 32-bit float tag {PLANE_F32_TAG}"
            )));
        }
        let (Ok(rows), Ok(cols)) = (usize::try_from(rows), usize::try_from(cols)) else {
            return Err(CascadeError::config(format!(
                "plane has negative dimensions {rows}x{cols}"
            )));
        };
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| CascadeError::config(format!("plane of {rows}x{cols} is too large")))?;
        let mut data = Vec::with_capacity(len.min(MAX_PREALLOCATION));
        for _ in 0..len {
            data.push(f32::decode(reader)?);
        }
        Plane::from_shape_vec((rows, cols), data)
            .map_err(|err| CascadeError::config(format!("invalid plane data: {err}")))
    }
}

impl Encode for Layer {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.kind().as_str().to_string().encode(writer)?;
        encode_slice(self.weights(), writer)?;
        encode_slice(self.bias(), writer)?;
        self.params().encode(writer)
    }
}

impl Decode for Layer {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let kind: LayerKind = String::decode(reader)?.parse()?;
        let weights = Vec::<Plane>::decode(reader)?;
        let bias = Vec::<f32>::decode(reader)?;
        let params = BTreeMap::<String, f32>::decode(reader)?;
        Ok(Layer::from_parts(kind, params, weights, bias))
    }
}

impl Encode for Network {
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.name().to_string().encode(writer)?;
        encode_slice(self.layers(), writer)?;
        encode_slice(self.layer_names(), writer)?;
        (self.name_index().len() as u64).encode(writer)?;
        for (name, &position) in self.name_index() {
            name.encode(writer)?;
            (position as u64).encode(writer)?;
        }
        Ok(())
    }
}

impl Decode for Network {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, CascadeError> {
        let name = String::decode(reader)?;
        let layers = Vec::<Layer>::decode(reader)?;
        let order = Vec::<String>::decode(reader)?;
        let index = BTreeMap::<String, u64>::decode(reader)?
            .into_iter()
            .map(|(key, position)| {
                usize::try_from(position)
                    .map(|position| (key, position))
                    .map_err(|_| CascadeError::config(format!("layer index {position} is too large")))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Network::from_parts(name, layers, order, index)
    }
}

fn encode_slice<T: Encode, W: Write>(items: &[T], writer: &mut W) -> io::Result<()> {
    (items.len() as u64).encode(writer)?;
    items.iter().try_for_each(|item| item.encode(writer))
}

/// Encode a network into a fresh buffer.
pub fn to_bytes(network: &Network) -> Result<Vec<u8>, CascadeError> {
    let mut bytes = Vec::new();
    write_network(network, &mut bytes)?;
    Ok(bytes)
}

/// Decode and validate a network from a byte slice; trailing bytes are rejected.
pub fn from_bytes(bytes: &[u8]) -> Result<Network, CascadeError> {
    let mut cursor = bytes;
    let network = read_network(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(CascadeError::config(format!(
            "{} trailing byte(s) after network '{}'",
            cursor.len(),
            network.name()
        )));
    }
    Ok(network)
}

/// Decode a network from a stream and validate it.
pub fn read_network<R: Read>(reader: &mut R) -> Result<Network, CascadeError> {
    let network = Network::decode(reader)?;
    network.validate()?;
    Ok(network)
}

pub fn write_network<W: Write>(network: &Network, writer: &mut W) -> Result<(), CascadeError> {
    network
        .encode(writer)
        .map_err(|err| CascadeError::io(format!("failed to encode network '{}'", network.name()), err))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a network to `path` as a whole: the bytes go to a sibling temporary file that is then
/// renamed over the destination.
pub fn save_network<P: AsRef<Path>>(network: &Network, path: P) -> Result<(), CascadeError> {
    let path = path.as_ref();
    let staging = staging_path(path);
    let write = || -> io::Result<()> {
        let file = File::create(&staging)?;
        let mut writer = BufWriter::new(file);
        network.encode(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&staging);
        return Err(CascadeError::io(
            format!("failed to write model {}", staging.display()),
            err,
        ));
    }
    fs::rename(&staging, path).map_err(|err| {
        let _ = fs::remove_file(&staging);
        CascadeError::io(format!("failed to move model into {}", path.display()), err)
    })?;
    info!(
        "Saved network '{}' ({} layers) to {}",
        network.name(),
        network.len(),
        path.display()
    );
    Ok(())
}

/// Read and validate a network written by [`save_network`].
pub fn load_network<P: AsRef<Path>>(path: P) -> Result<Network, CascadeError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| CascadeError::io(format!("failed to open model {}", path.display()), err))?;
    let mut reader = BufReader::new(file);
    let network = read_network(&mut reader).map_err(|err| match err {
        CascadeError::Io { context, source } => {
            CascadeError::io(format!("{context} in {}", path.display()), source)
        }
        other => other,
    })?;

    let mut byte = [0u8; 1];
    let trailing = reader
        .read(&mut byte)
        .map_err(|err| CascadeError::io(format!("failed to read {}", path.display()), err))?;
    if trailing != 0 {
        return Err(CascadeError::config(format!(
            "model {} has trailing bytes after network '{}'",
            path.display(),
            network.name()
        )));
    }

    debug!("Loaded network {network} from {}", path.display());
    Ok(network)
}
