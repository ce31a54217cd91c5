//! Sequential network built from the configured layer stack.
//!
//! The network always yields logits; the output activation (softmax or
//! linear) is applied by [`Network::forward`] so losses can work on the
//! numerically stable log-softmax of the logits.

use crate::error::{MlError, Result};
use candle_core::{D, Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder, ops};
use theia_core::{Activation, LayerConfig, TheiaConfig};

enum Layer {
    Flatten,
    Dense {
        linear: Linear,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

/// Feed-forward classifier.
pub struct Network {
    layers: Vec<Layer>,
    input_shape: Vec<usize>,
    num_classes: usize,
}

impl Network {
    /// Build the layers of `config`, registering weights through `vb`.
    ///
    /// Dense layers are named `dense_<index>` after their position in the
    /// stack, so weights saved from one network load into any network built
    /// from the same layer list.
    pub fn new(config: &TheiaConfig, vb: VarBuilder) -> Result<Self> {
        let mut dims = config.input_shape.clone();
        let mut layers = Vec::with_capacity(config.layers.len());

        for (index, layer) in config.layers.iter().enumerate() {
            match layer {
                LayerConfig::Flatten => {
                    dims = vec![dims.iter().product()];
                    layers.push(Layer::Flatten);
                }
                LayerConfig::Dense { units, activation } => {
                    if dims.len() != 1 {
                        return Err(MlError::model(format!(
                            "dense layer {index} expects flat input but receives shape {dims:?}; add a flatten layer before it"
                        )));
                    }
                    let linear = candle_nn::linear(dims[0], *units, vb.pp(format!("dense_{index}")))?;
                    dims = vec![*units];
                    layers.push(Layer::Dense {
                        linear,
                        activation: *activation,
                    });
                }
                LayerConfig::Dropout { rate } => layers.push(Layer::Dropout {
                    rate: *rate as f32,
                }),
            }
        }

        if dims != [config.output_shape] {
            return Err(MlError::model(format!(
                "network produces shape {dims:?}, expected [{}]",
                config.output_shape
            )));
        }

        Ok(Self {
            layers,
            input_shape: config.input_shape.clone(),
            num_classes: config.output_shape,
        })
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Unnormalised class scores, shape `[batch, classes]`.
    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_t(xs, train)?)
    }

    /// Class probabilities, shape `[batch, classes]`.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let logits = self.forward_t(xs, train)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }

    /// Most likely class for every sample in the batch.
    pub fn predict_classes(&self, xs: &Tensor) -> Result<Vec<u32>> {
        let logits = self.forward_t(xs, false)?;
        Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
    }
}

impl ModuleT for Network {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut xs = xs.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            xs = match layer {
                Layer::Flatten => xs.flatten_from(1)?,
                Layer::Dense { linear, activation } => {
                    let ys = linear.forward(&xs)?;
                    // The output activation is left to the caller.
                    if index == last {
                        ys
                    } else {
                        activate(&ys, *activation)?
                    }
                }
                Layer::Dropout { rate } if train && *rate > 0.0 => ops::dropout(&xs, *rate)?,
                Layer::Dropout { .. } => xs,
            };
        }
        Ok(xs)
    }
}

fn activate(xs: &Tensor, activation: Activation) -> candle_core::Result<Tensor> {
    match activation {
        Activation::Relu => xs.relu(),
        Activation::Sigmoid => ops::sigmoid(xs),
        Activation::Tanh => xs.tanh(),
        Activation::Linear => Ok(xs.clone()),
        Activation::Softmax => ops::softmax(xs, D::Minus1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> TheiaConfig {
        TheiaConfig {
            input_shape: vec![2, 2],
            output_shape: 3,
            layers: vec![
                LayerConfig::Flatten,
                LayerConfig::Dense {
                    units: 8,
                    activation: Activation::Relu,
                },
                LayerConfig::Dropout { rate: 0.5 },
                LayerConfig::Dense {
                    units: 3,
                    activation: Activation::Softmax,
                },
            ],
            ..TheiaConfig::default()
        }
    }

    #[test]
    fn test_forward_shapes_and_probabilities() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&tiny_config(), vb).unwrap();

        let xs = Tensor::ones((5, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let probs = network.forward(&xs, false).unwrap();
        assert_eq!(probs.dims(), &[5, 3]);

        let rows = probs.to_vec2::<f32>().unwrap();
        for row in rows {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        assert_eq!(network.predict_classes(&xs).unwrap().len(), 5);
    }

    #[test]
    fn test_named_variables() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Network::new(&tiny_config(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["dense_1.bias", "dense_1.weight", "dense_3.bias", "dense_3.weight"]
        );
    }

    #[test]
    fn test_dense_without_flatten_is_rejected() {
        let mut config = tiny_config();
        config.layers.remove(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(Network::new(&config, vb), Err(MlError::Model(_))));
    }

    #[test]
    fn test_dropout_inactive_at_inference() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&tiny_config(), vb).unwrap();

        let xs = Tensor::ones((4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let a = network.logits(&xs, false).unwrap().to_vec2::<f32>().unwrap();
        let b = network.logits(&xs, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
