//! Cross-entropy losses over logits.

use crate::error::Result;
use candle_core::{D, DType, Tensor};
use candle_nn::ops;
use theia_core::LossKind;

/// Loss selected in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loss {
    kind: LossKind,
}

impl Loss {
    pub fn new(kind: LossKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            LossKind::CategoricalCrossentropy => "categorical_crossentropy",
            LossKind::SparseCategoricalCrossentropy => "sparse_categorical_crossentropy",
        }
    }

    /// Mean loss over the batch as a scalar tensor.
    ///
    /// `logits` is `[batch, classes]`, `labels` holds `u32` class indices.
    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let loss = match self.kind {
            LossKind::SparseCategoricalCrossentropy => {
                candle_nn::loss::cross_entropy(logits, labels)?
            }
            LossKind::CategoricalCrossentropy => {
                let classes = logits.dim(D::Minus1)?;
                let targets = one_hot(labels, classes)?;
                let log_probs = ops::log_softmax(logits, D::Minus1)?;
                targets.mul(&log_probs)?.sum(D::Minus1)?.mean_all()?.neg()?
            }
        };
        Ok(loss)
    }
}

/// One-hot encode `u32` class indices into an f32 `[batch, classes]` tensor.
pub fn one_hot(labels: &Tensor, classes: usize) -> Result<Tensor> {
    let indices = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let mut data = vec![0f32; indices.len() * classes];
    for (row, &class) in indices.iter().enumerate() {
        let class = class as usize;
        if class >= classes {
            return Err(crate::error::MlError::invalid_input(format!(
                "label {class} out of range for {classes} classes"
            )));
        }
        data[row * classes + class] = 1.0;
    }
    Ok(Tensor::from_vec(data, (indices.len(), classes), labels.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch() -> (Tensor, Tensor) {
        let logits = Tensor::new(&[[2.0f32, 0.5, -1.0], [0.1, 0.2, 3.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        (logits, labels)
    }

    #[test]
    fn test_both_kinds_agree() {
        let (logits, labels) = batch();
        let dense = Loss::new(LossKind::CategoricalCrossentropy)
            .compute(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let sparse = Loss::new(LossKind::SparseCategoricalCrossentropy)
            .compute(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((dense - sparse).abs() < 1e-5);
        assert!(dense > 0.0);
    }

    #[test]
    fn test_uniform_logits_give_log_classes() {
        let logits = Tensor::zeros((4, 10), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32, 2, 3, 4], &Device::Cpu).unwrap();
        let loss = Loss::new(LossKind::CategoricalCrossentropy)
            .compute(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 10f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let labels = Tensor::new(&[5u32], &Device::Cpu).unwrap();
        assert!(one_hot(&labels, 3).is_err());
    }
}
