//! Streaming metrics and per-epoch training history.

use crate::error::Result;
use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use theia_core::MetricKind;

/// A metric accumulated over the batches of one phase.
pub trait Metric: Send {
    fn name(&self) -> &str;

    /// Fold one batch into the running state.
    fn update_state(&mut self, labels: &Tensor, logits: &Tensor) -> Result<()>;

    /// Current value; 0.0 before any update.
    fn result(&self) -> f64;

    fn reset_states(&mut self);
}

/// Fraction of samples whose highest-scoring class is the label.
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl CategoricalAccuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for CategoricalAccuracy {
    fn name(&self) -> &str {
        "categorical_accuracy"
    }

    fn update_state(&mut self, labels: &Tensor, logits: &Tensor) -> Result<()> {
        let predicted = logits.argmax(D::Minus1)?;
        let labels = labels.to_dtype(DType::U32)?;
        let correct = predicted
            .eq(&labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        self.correct += correct as usize;
        self.total += labels.dim(0)?;
        Ok(())
    }

    fn result(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    fn reset_states(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Fraction of samples whose label is among the `k` highest-scoring classes.
#[derive(Debug, Clone)]
pub struct TopKCategoricalAccuracy {
    k: usize,
    correct: usize,
    total: usize,
}

impl TopKCategoricalAccuracy {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            correct: 0,
            total: 0,
        }
    }
}

impl Metric for TopKCategoricalAccuracy {
    fn name(&self) -> &str {
        "top_k_categorical_accuracy"
    }

    fn update_state(&mut self, labels: &Tensor, logits: &Tensor) -> Result<()> {
        let scores = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        for (row, label) in scores.iter().zip(labels) {
            let Some(&target) = row.get(label as usize) else {
                continue;
            };
            // Ties count in the label's favour.
            let better = row.iter().filter(|&&score| score > target).count();
            if better < self.k {
                self.correct += 1;
            }
        }
        self.total += scores.len();
        Ok(())
    }

    fn result(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    fn reset_states(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Running mean of scalar values, used for the loss.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    total: f64,
    count: usize,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn result(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }
}

/// The configured metrics, updated together.
pub struct MetricSet {
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricSet {
    pub fn from_config(kinds: &[MetricKind]) -> Self {
        let metrics = kinds
            .iter()
            .map(|kind| -> Box<dyn Metric> {
                match kind {
                    MetricKind::CategoricalAccuracy => Box::new(CategoricalAccuracy::new()),
                    MetricKind::TopKCategoricalAccuracy { k } => {
                        Box::new(TopKCategoricalAccuracy::new(*k))
                    }
                }
            })
            .collect();
        Self { metrics }
    }

    pub fn update_state(&mut self, labels: &Tensor, logits: &Tensor) -> Result<()> {
        for metric in &mut self.metrics {
            metric.update_state(labels, logits)?;
        }
        Ok(())
    }

    pub fn reset_states(&mut self) {
        for metric in &mut self.metrics {
            metric.reset_states();
        }
    }

    /// `(prefix + name, value)` pairs in configuration order.
    pub fn results(&self, prefix: &str) -> Vec<(String, f64)> {
        self.metrics
            .iter()
            .map(|metric| (format!("{prefix}{}", metric.name()), metric.result()))
            .collect()
    }

    /// Progress line such as `loss: 0.3012 categorical_accuracy: 0.9100 `.
    pub fn format_line(&self, prefix: &str, loss: f64) -> String {
        let mut line = format!("{prefix}loss: {loss:.4} ");
        for (name, value) in self.results(prefix) {
            line.push_str(&format!("{name}: {value:.4} "));
        }
        line
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Per-epoch training history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub custom_metrics: HashMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, loss: f64, val_loss: Option<f64>) {
        self.loss_history.push(loss);
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        self.epochs_completed += 1;

        let check_loss = val_loss.unwrap_or(loss);
        if self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Most recent value of a custom metric.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.custom_metrics.get(name)?.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch() -> (Tensor, Tensor) {
        let logits = Tensor::new(
            &[[0.9f32, 0.05, 0.05], [0.2, 0.7, 0.1], [0.5, 0.3, 0.2], [0.1, 0.3, 0.6]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[0u32, 1, 1, 0], &Device::Cpu).unwrap();
        (logits, labels)
    }

    #[test]
    fn test_categorical_accuracy() {
        let (logits, labels) = batch();
        let mut acc = CategoricalAccuracy::new();
        acc.update_state(&labels, &logits).unwrap();
        assert_eq!(acc.result(), 0.5);
        acc.reset_states();
        assert_eq!(acc.result(), 0.0);
    }

    #[test]
    fn test_top_k_accuracy() {
        let (logits, labels) = batch();
        let mut top2 = TopKCategoricalAccuracy::new(2);
        top2.update_state(&labels, &logits).unwrap();
        // Rows 0, 1, 2 have their label in the top two; row 3 ranks it last.
        assert_eq!(top2.result(), 0.75);
    }

    #[test]
    fn test_mean() {
        let mut mean = Mean::new();
        assert_eq!(mean.result(), 0.0);
        mean.update(1.0);
        mean.update(3.0);
        assert_eq!(mean.result(), 2.0);
    }

    #[test]
    fn test_metric_set_line() {
        let (logits, labels) = batch();
        let mut set = MetricSet::from_config(&[MetricKind::CategoricalAccuracy]);
        set.update_state(&labels, &logits).unwrap();
        assert_eq!(
            set.format_line("val_", 0.25),
            "val_loss: 0.2500 val_categorical_accuracy: 0.5000 "
        );
    }

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.5, Some(0.6));
        metrics.record_epoch(0.3, Some(0.4));
        assert_eq!(metrics.epochs_completed, 2);
        assert_eq!(metrics.best_epoch, Some(2));
        assert_eq!(metrics.best_loss, Some(0.4));
    }

    #[test]
    fn test_custom_metric_last() {
        let mut metrics = TrainingMetrics::default();
        metrics.add_custom_metric("categorical_accuracy", 0.8);
        metrics.add_custom_metric("categorical_accuracy", 0.9);
        assert_eq!(metrics.last("categorical_accuracy"), Some(0.9));
        assert_eq!(metrics.last("missing"), None);
    }
}
