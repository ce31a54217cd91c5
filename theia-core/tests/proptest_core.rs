//! Property-based tests for run ids and configuration validation.

use proptest::prelude::*;

use theia_core::{LayerConfig, RunId, TheiaConfig};

proptest! {
    #[test]
    fn plain_ids_are_accepted(id in "[A-Za-z0-9_-]{1,40}") {
        prop_assume!(!id.contains(".."));
        let run_id = RunId::new(id.clone()).unwrap();
        prop_assert_eq!(run_id.as_str(), id.as_str());
    }

    #[test]
    fn ids_with_separators_are_rejected(
        head in "[a-z]{0,8}",
        sep in prop::sample::select(vec!['/', '\\', ' ', '\t']),
        tail in "[a-z]{0,8}",
    ) {
        let id = format!("{head}{sep}{tail}");
        prop_assert!(RunId::new(id).is_err());
    }

    #[test]
    fn output_layer_must_match_classes(classes in 1usize..64, units in 1usize..64) {
        let mut config = TheiaConfig {
            output_shape: classes,
            ..TheiaConfig::default()
        };
        config.layers.pop();
        config.layers.push(LayerConfig::Dense {
            units,
            activation: theia_core::Activation::Softmax,
        });
        prop_assert_eq!(config.validate().is_ok(), units == classes);
    }
}
