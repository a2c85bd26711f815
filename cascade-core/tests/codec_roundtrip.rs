use std::fs;

use cascade_core::{
    CascadeError, FeatureMap, LayerKind, LayerSpec, Network, Plane, build_network, load_network,
    save_network,
};
use tempfile::tempdir;

/// The 12-pixel stage layout: conv 16@3x3, pool 3/2, fc 16, fc 2, softmax.
fn twelve_net_table() -> Vec<LayerSpec> {
    vec![
        LayerSpec::conv(16, 1, 3, 1, 0),
        LayerSpec::max_pool(3, 2, 0),
        LayerSpec::relu(),
        LayerSpec::fc(16, 16, 4, 4),
        LayerSpec::relu(),
        LayerSpec::fc(2, 16, 1, 1),
        LayerSpec::softmax(),
    ]
}

fn twelve_net_weights() -> Vec<u8> {
    let count = (16 * 9 + 16) + (16 * 16 * 16 + 16) + (2 * 16 + 2);
    (0..count)
        .map(|i| ((i * 37 % 101) as f32 - 50.0) / 250.0)
        .flat_map(f32::to_le_bytes)
        .collect()
}

fn twelve_net() -> Network {
    let bytes = twelve_net_weights();
    build_network("12net", &twelve_net_table(), bytes.as_slice()).expect("build 12net")
}

fn sample_input() -> FeatureMap {
    FeatureMap::from_plane(Plane::from_shape_fn((12, 12), |(r, c)| {
        ((r * 12 + c) % 17) as f32 / 17.0
    }))
}

#[test]
fn saved_network_reloads_identically() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("12net.bin");
    let network = twelve_net();

    save_network(&network, &path).expect("save");
    let restored = load_network(&path).expect("load");

    assert_eq!(restored.name(), "12net");
    assert_eq!(restored.len(), network.len());
    assert_eq!(restored.layer_names(), network.layer_names());
    for (original, loaded) in network.layers().iter().zip(restored.layers()) {
        assert_eq!(original.kind(), loaded.kind());
        assert_eq!(original.params(), loaded.params());
        let bits = |planes: &[Plane]| {
            planes
                .iter()
                .flat_map(|plane| plane.iter().map(|v| v.to_bits()).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        };
        assert_eq!(bits(original.weights()), bits(loaded.weights()));
        let bias_bits = |bias: &[f32]| bias.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bias_bits(original.bias()), bias_bits(loaded.bias()));
    }

    let expected = network.forward(&sample_input()).expect("forward original");
    let actual = restored.forward(&sample_input()).expect("forward restored");
    assert_eq!(expected, actual);
    assert_eq!(actual.channels(), 2);
    let total: f32 = actual.values_at(0, 0).iter().sum();
    assert!((total - 1.0).abs() < 1e-5);
}

#[test]
fn save_replaces_existing_file_without_leftovers() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("model.bin");
    fs::write(&path, b"stale").expect("seed stale file");

    save_network(&twelve_net(), &path).expect("save");
    assert!(load_network(&path).is_ok());

    let entries: Vec<_> = fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn truncated_model_file_is_io_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("12net.bin");
    save_network(&twelve_net(), &path).expect("save");

    let bytes = fs::read(&path).expect("read");
    fs::write(&path, &bytes[..bytes.len() - 10]).expect("truncate");

    let err = load_network(&path).unwrap_err();
    assert!(matches!(err, CascadeError::Io { .. }), "unexpected error: {err}");
}

#[test]
fn missing_model_file_is_io_error() {
    let dir = tempdir().expect("tempdir");
    let err = load_network(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, CascadeError::Io { .. }));
}

#[test]
fn table_layers_carry_expected_geometry() {
    let network = twelve_net();
    let kinds: Vec<LayerKind> = network.layers().iter().map(|layer| layer.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            LayerKind::Conv,
            LayerKind::MaxPool,
            LayerKind::Relu,
            LayerKind::Fc,
            LayerKind::Relu,
            LayerKind::Fc,
            LayerKind::Softmax,
        ]
    );
    let fc = network.layer("3.12net.fc").expect("fc layer");
    assert_eq!(fc.weights().len(), 256);
    assert_eq!(fc.weights()[0].dim(), (4, 4));
    assert_eq!(fc.param("outputCount").expect("outputCount"), 16.0);
}
