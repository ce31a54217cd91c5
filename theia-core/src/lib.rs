//! # Theia Core
//!
//! Configuration, run identifiers, persistence helpers and console styling
//! shared by the training library and the `theia` binary.

pub mod config;
pub mod console;
pub mod error;
pub mod persistence;
pub mod run_id;

// Re-export commonly used types at the crate root.
pub use config::{
    Activation, CallbackConfig, CheckpointState, ConfigOverrides, LayerConfig, LossKind,
    MetricKind, OptimizerConfig, TheiaConfig, load_config,
};
pub use error::{ConfigError, CoreError, Result};
pub use run_id::RunId;
