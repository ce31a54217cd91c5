//! Property tests for batching and metrics.

use candle_core::{Device, Tensor};
use proptest::prelude::*;
use theia_ml::Dataset;
use theia_ml::metrics::{CategoricalAccuracy, Metric, TopKCategoricalAccuracy};

fn labelled(n: usize) -> Dataset {
    let images = (0..n * 2).map(|v| v as f32).collect();
    let labels = (0..n as u32).collect();
    Dataset::new(images, labels, vec![2]).unwrap()
}

proptest! {
    #[test]
    fn batches_visit_every_sample_once(
        n in 1usize..60,
        batch_size in 1usize..20,
        seed in proptest::option::of(any::<u64>()),
    ) {
        let dataset = labelled(n);
        let device = Device::Cpu;
        let mut seen = Vec::new();
        let mut count = 0;
        for batch in dataset.batches(batch_size, seed, &device) {
            let batch = batch.unwrap();
            prop_assert!(batch.labels.dim(0).unwrap() <= batch_size);
            seen.extend(batch.labels.to_vec1::<u32>().unwrap());
            count += 1;
        }
        prop_assert_eq!(count, dataset.num_batches(batch_size));
        seen.sort();
        prop_assert_eq!(seen, (0..n as u32).collect::<Vec<_>>());
    }

    #[test]
    fn top_k_never_below_top_1(
        scores in proptest::collection::vec(proptest::collection::vec(-5.0f32..5.0, 4), 1..12),
        k in 1usize..4,
    ) {
        let rows = scores.len();
        let labels: Vec<u32> = (0..rows as u32).map(|i| i % 4).collect();
        let flat: Vec<f32> = scores.into_iter().flatten().collect();
        let logits = Tensor::from_vec(flat, (rows, 4), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(labels, rows, &Device::Cpu).unwrap();

        let mut top1 = CategoricalAccuracy::new();
        let mut topk = TopKCategoricalAccuracy::new(k);
        top1.update_state(&labels, &logits).unwrap();
        topk.update_state(&labels, &logits).unwrap();
        prop_assert!(topk.result() >= top1.result());
        prop_assert!((0.0..=1.0).contains(&topk.result()));
    }
}
