//! # theia-ml — model training for Theia
//!
//! Wraps candle's tensors and autodiff in a Keras-style training loop for
//! image classifiers: a configured feed-forward network, optimizers whose
//! state can be checkpointed, cross-entropy losses, streaming metrics,
//! callbacks, per-run checkpoints and a local experiment tracker.

// Model
pub mod error;
pub mod loss;
pub mod network;
pub mod optim;

// Data and metrics
pub mod data;
pub mod metrics;

// Training
pub mod callbacks;
pub mod checkpoint;
pub mod tracking;
pub mod training;

// Re-exports
pub use callbacks::{Callback, CallbackAction, CallbackList, History, Logs};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use data::{Batch, Dataset, Split};
pub use error::{MlError, Result};
pub use metrics::TrainingMetrics;
pub use network::Network;
pub use optim::TrainableOptimizer;
pub use tracking::{LocalTracker, Resume, RunRecord, Tracker, TrainingStatus};
pub use training::TrainingRunner;
