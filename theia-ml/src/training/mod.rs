//! Training loop and its terminal progress display.

pub mod progress;
pub mod runner;

pub use progress::TrainingProgress;
pub use runner::TrainingRunner;
