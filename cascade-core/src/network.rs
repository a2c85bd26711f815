//! Straight-line layer pipelines.

use std::collections::BTreeMap;
use std::fmt;

use log::trace;

use crate::error::CascadeError;
use crate::feature_map::{FeatureMap, Plane};
use crate::layer::{Layer, LayerConfig};
use crate::ops;

/// An ordered pipeline of layers with a name lookup.
///
/// Layers run in declaration order and are named `"<index>.<network>.<type>"`. Once built, a
/// network is only read by [`Network::forward`], so a shared reference can serve any number of
/// threads at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    name: String,
    layers: Vec<Layer>,
    order: Vec<String>,
    index: BTreeMap<String, usize>,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            order: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    /// Reassemble a network from decoded parts, checking that the execution order and the name
    /// lookup describe the same layers.
    pub fn from_parts(
        name: String,
        layers: Vec<Layer>,
        order: Vec<String>,
        index: BTreeMap<String, usize>,
    ) -> Result<Self, CascadeError> {
        let network = Self {
            name,
            layers,
            order,
            index,
        };
        network.check_structure()?;
        Ok(network)
    }

    /// Append a layer and return it for further configuration.
    pub fn add_layer(&mut self, layer: Layer) -> &mut Layer {
        let position = self.layers.len();
        let name = format!("{position}.{}.{}", self.name, layer.kind());
        self.order.push(name.clone());
        self.index.insert(name, position);
        self.layers.push(layer);
        &mut self.layers[position]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Layer names in execution order.
    pub fn layer_names(&self) -> &[String] {
        &self.order
    }

    /// Layers as stored.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub(crate) fn name_index(&self) -> &BTreeMap<String, usize> {
        &self.index
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.index.get(name).and_then(|&i| self.layers.get(i))
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        let position = *self.index.get(name)?;
        self.layers.get_mut(position)
    }

    /// Layers in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Layer)> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.layer(name).map(|layer| (name.as_str(), layer)))
    }

    /// Run `input` through every layer.
    pub fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, CascadeError> {
        if self.order.is_empty() {
            return Err(CascadeError::config(format!(
                "network '{}' has no layers",
                self.name
            )));
        }

        let mut current = input.clone();
        for name in &self.order {
            let layer = self.layer(name).ok_or_else(|| {
                CascadeError::config(format!("network '{}' has no layer '{name}'", self.name))
            })?;
            current = run_layer(layer, &current)?;
            trace!(
                "{name}: {} channel(s) of {:?}",
                current.channels(),
                current.dim()
            );
        }
        Ok(current)
    }

    /// Convenience for single-channel inputs.
    pub fn forward_plane(&self, plane: &Plane) -> Result<FeatureMap, CascadeError> {
        self.forward(&FeatureMap::from_plane(plane.clone()))
    }

    /// Check the name lookup and every layer's parameters and weights.
    pub fn validate(&self) -> Result<(), CascadeError> {
        self.check_structure()?;
        for (name, layer) in self.iter() {
            layer.validate().map_err(|err| match err {
                CascadeError::Configuration(message) => {
                    CascadeError::config(format!("{name}: {message}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    fn check_structure(&self) -> Result<(), CascadeError> {
        if self.order.len() != self.layers.len() || self.index.len() != self.layers.len() {
            return Err(CascadeError::config(format!(
                "network '{}' lists {} layer name(s) and {} index entr(ies) for {} layer(s)",
                self.name,
                self.order.len(),
                self.index.len(),
                self.layers.len()
            )));
        }
        let mut seen = vec![false; self.layers.len()];
        for name in &self.order {
            let Some(&position) = self.index.get(name) else {
                return Err(CascadeError::config(format!(
                    "network '{}' orders unknown layer '{name}'",
                    self.name
                )));
            };
            match seen.get_mut(position) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(CascadeError::config(format!(
                        "network '{}' maps '{name}' to invalid or repeated index {position}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn run_layer(layer: &Layer, input: &FeatureMap) -> Result<FeatureMap, CascadeError> {
    match layer.config()? {
        LayerConfig::Conv {
            kernel_depth,
            output_count,
            stride,
            pad,
        } => {
            if layer.bias().len() != output_count {
                return Err(CascadeError::config(format!(
                    "conv layer declares {output_count} output(s) but holds {} bias value(s)",
                    layer.bias().len()
                )));
            }
            ops::conv_layer(input, layer.weights(), layer.bias(), kernel_depth, stride, pad)
        }
        LayerConfig::Relu => Ok(ops::relu_layer(input)),
        LayerConfig::MaxPool { kernel, stride, pad } => {
            ops::max_pool_layer(input, kernel, stride, pad)
        }
        LayerConfig::Softmax => Ok(ops::softmax(input)),
        LayerConfig::Fc { output_count } => {
            ops::fc(input, layer.weights(), layer.bias(), output_count)
        }
        LayerConfig::Norm { mean, stdev } => Ok(ops::norm(input, mean, stdev)),
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.name)?;
        for (i, name) in self.order.iter().enumerate() {
            let separator = if i == 0 { " " } else { " -> " };
            write!(f, "{separator}{name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{CascadeParams, LayerKind};

    fn tiny_network() -> Network {
        let mut network = Network::new("tiny");
        network
            .add_layer(Layer::with_geometry(
                LayerKind::Conv,
                &CascadeParams::conv(2, 1, 2, 1, 0),
            ))
            .set_weights(
                vec![Plane::from_elem((2, 2), 0.25), Plane::from_elem((2, 2), -0.25)],
                vec![0.0, 0.0],
            )
            .expect("conv weights");
        network.add_layer(Layer::new(LayerKind::Relu));
        network.add_layer(Layer::with_geometry(
            LayerKind::MaxPool,
            &CascadeParams::pool(2, 2, 0),
        ));
        network.add_layer(Layer::new(LayerKind::Softmax));
        network
    }

    #[test]
    fn names_follow_declaration_order() {
        let network = tiny_network();
        assert_eq!(
            network.layer_names(),
            ["0.tiny.conv", "1.tiny.relu", "2.tiny.maxpool", "3.tiny.softmax"]
        );
        assert_eq!(network.len(), 4);
        assert_eq!(
            network.layer("2.tiny.maxpool").map(Layer::kind),
            Some(LayerKind::MaxPool)
        );
        assert!(network.layer("missing").is_none());
        assert_eq!(
            network.to_string(),
            "tiny: 0.tiny.conv -> 1.tiny.relu -> 2.tiny.maxpool -> 3.tiny.softmax"
        );
    }

    #[test]
    fn forward_threads_layers_in_order() {
        let network = tiny_network();
        let input = Plane::from_elem((5, 5), 2.0);
        let output = network.forward_plane(&input).unwrap();
        assert_eq!(output.channels(), 2);
        assert_eq!(output.dim(), (2, 2));
        // Channel 0 carries 2.0 after relu, channel 1 is clamped to 0.
        let expected = 2.0f32.exp() / (2.0f32.exp() + 1.0);
        for value in output.planes()[0].iter() {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn empty_network_is_a_configuration_error() {
        let network = Network::new("empty");
        let input = FeatureMap::from_plane(Plane::zeros((2, 2)));
        assert!(matches!(
            network.forward(&input),
            Err(CascadeError::Configuration(_))
        ));
    }

    #[test]
    fn huge_padding_fails_forward_without_panicking() {
        let mut network = Network::new("padded");
        network
            .add_layer(Layer::with_geometry(
                LayerKind::MaxPool,
                &CascadeParams::pool(2, 1, 0),
            ))
            .set_param("padH", 1e9)
            .set_param("padW", 1e9);
        assert!(network.validate().is_ok());
        let input = FeatureMap::from_plane(Plane::zeros((2, 2)));
        assert!(matches!(
            network.forward(&input),
            Err(CascadeError::Geometry(_))
        ));

        network
            .layer_mut("0.padded.maxpool")
            .expect("pool layer")
            .set_param("padH", 1e30);
        assert!(matches!(
            network.forward(&input),
            Err(CascadeError::Configuration(_))
        ));
    }

    #[test]
    fn missing_parameter_fails_forward() {
        let mut network = Network::new("broken");
        network.add_layer(Layer::new(LayerKind::MaxPool));
        let input = FeatureMap::from_plane(Plane::zeros((4, 4)));
        assert!(matches!(
            network.forward(&input),
            Err(CascadeError::Configuration(_))
        ));
        assert!(network.validate().is_err());
    }

    #[test]
    fn inconsistent_parts_are_rejected() {
        let network = tiny_network();
        let mut order = network.layer_names().to_vec();
        order.swap(0, 1);
        order[0] = "bogus".to_string();
        let result = Network::from_parts(
            network.name().to_string(),
            network.layers().to_vec(),
            order,
            network.name_index().clone(),
        );
        assert!(matches!(result, Err(CascadeError::Configuration(_))));
    }

    #[test]
    fn layer_mut_allows_late_configuration() {
        let mut network = Network::new("late");
        network.add_layer(Layer::new(LayerKind::Norm));
        network
            .layer_mut("0.late.norm")
            .expect("layer exists")
            .set_param("stdev", 3.0);
        assert_eq!(network.layer("0.late.norm").unwrap().param_or("stdev", 1.0), 3.0);
    }
}
