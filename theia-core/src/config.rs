//! Configuration for Theia training runs.
//!
//! Uses `figment` for layered configuration: defaults -> user file ->
//! workspace file -> explicit file -> environment -> CLI overrides.

use crate::error::ConfigError;
use crate::run_id::RunId;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG_FILE: &str = "theia.toml";

/// Environment variable prefix (`THEIA_EPOCHS`, `THEIA_OPTIMIZER__LEARNING_RATE`, ...).
pub const ENV_PREFIX: &str = "THEIA_";

/// Overrides the directory holding the user config file.
pub const CONFIG_HOME_ENV: &str = "THEIA_CONFIG_HOME";

/// Complete configuration of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheiaConfig {
    /// Model name. Also the project name in the tracking store.
    pub name: String,
    /// Run id. When unset a timestamped id is generated per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Shape of one input sample, without the batch dimension.
    pub input_shape: Vec<usize>,
    /// Number of output classes.
    pub output_shape: usize,
    /// Send epoch logs to the tracking store instead of the console.
    #[serde(default = "default_true")]
    pub use_tracking: bool,
    pub optimizer: OptimizerConfig,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
    pub batch_size: usize,
    pub epochs: usize,
    #[serde(default)]
    pub callbacks: Vec<CallbackConfig>,
    /// Whether to write a checkpoint at the end of every epoch.
    pub checkpoint_state: CheckpointState,
    /// Root directory for per-epoch checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Root directory for saved model weights.
    pub save_dir: PathBuf,
    /// Root directory of the local tracking store.
    #[serde(default = "default_tracking_dir")]
    pub tracking_dir: PathBuf,
    /// Number of epoch checkpoints kept per run.
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    /// Refresh the displayed metrics every this many batches.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Seed for batch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    /// Layer stack, input to output.
    pub layers: Vec<LayerConfig>,
}

impl Default for TheiaConfig {
    fn default() -> Self {
        Self {
            name: "mnist-handwriting".to_string(),
            id: None,
            input_shape: vec![28, 28, 1],
            output_shape: 10,
            use_tracking: true,
            optimizer: OptimizerConfig::default(),
            loss: LossKind::CategoricalCrossentropy,
            metrics: vec![MetricKind::CategoricalAccuracy],
            batch_size: 32,
            epochs: 2,
            callbacks: vec![CallbackConfig::EpochLogger],
            checkpoint_state: CheckpointState::Epoch,
            checkpoint_dir: PathBuf::from("history").join("checkpoints"),
            save_dir: PathBuf::from("history").join("saved_models"),
            tracking_dir: default_tracking_dir(),
            max_to_keep: default_max_to_keep(),
            log_every: default_log_every(),
            seed: default_seed(),
            show_progress: true,
            layers: vec![
                LayerConfig::Flatten,
                LayerConfig::Dense {
                    units: 128,
                    activation: Activation::Relu,
                },
                LayerConfig::Dense {
                    units: 10,
                    activation: Activation::Softmax,
                },
            ],
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tracking_dir() -> PathBuf {
    PathBuf::from("history").join("runs")
}

fn default_max_to_keep() -> usize {
    5
}

fn default_log_every() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

/// When epoch checkpoints are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    NoCheckpoint,
    Epoch,
}

/// Optimizer selection and hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        learning_rate: f64,
        #[serde(default = "default_beta_1")]
        beta_1: f64,
        #[serde(default = "default_beta_2")]
        beta_2: f64,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    Sgd {
        learning_rate: f64,
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        nesterov: bool,
    },
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam { learning_rate, .. } | Self::Sgd { learning_rate, .. } => *learning_rate,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            learning_rate: 0.001,
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
        }
    }
}

fn default_beta_1() -> f64 {
    0.9
}

fn default_beta_2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-7
}

/// Loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Cross-entropy against one-hot encoded targets.
    CategoricalCrossentropy,
    /// Cross-entropy against integer class targets.
    SparseCategoricalCrossentropy,
}

/// Metric tracked during training and validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricKind {
    CategoricalAccuracy,
    TopKCategoricalAccuracy {
        #[serde(default = "default_top_k")]
        k: usize,
    },
}

fn default_top_k() -> usize {
    5
}

/// Layer activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
    Softmax,
}

/// One layer of the sequential model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Flatten,
    Dense {
        units: usize,
        #[serde(default = "default_activation")]
        activation: Activation,
    },
    Dropout {
        rate: f64,
    },
}

fn default_activation() -> Activation {
    Activation::Linear
}

/// Callbacks registered on top of the built-in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackConfig {
    /// Log each epoch's metrics through `tracing`.
    EpochLogger,
    /// Stop when the monitored value stops improving.
    EarlyStopping {
        #[serde(default = "default_monitor")]
        monitor: String,
        #[serde(default = "default_patience")]
        patience: usize,
        #[serde(default)]
        min_delta: f64,
    },
    /// Stop as soon as the loss becomes NaN or infinite.
    TerminateOnNan,
    /// Keep the best weights seen so far, judged by `monitor`.
    ModelCheckpoint {
        #[serde(default = "default_monitor")]
        monitor: String,
    },
}

fn default_monitor() -> String {
    "val_loss".to_string()
}

fn default_patience() -> usize {
    3
}

/// Values supplied on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_tracking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_state: Option<CheckpointState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_progress: Option<bool>,
}

impl TheiaConfig {
    pub fn checkpoints_enabled(&self) -> bool {
        self.checkpoint_state != CheckpointState::NoCheckpoint
    }

    /// Directory holding the epoch checkpoints of one run.
    pub fn run_checkpoint_dir(&self, run_id: &RunId) -> PathBuf {
        self.checkpoint_dir.join(&self.name).join(run_id)
    }

    /// Directory holding best-so-far snapshots written by `model_checkpoint`.
    pub fn best_checkpoint_dir(&self, run_id: &RunId) -> PathBuf {
        self.checkpoint_dir.join("checkpoints").join(run_id)
    }

    /// Directory the final weights of a run are saved to under `root`.
    pub fn saved_model_dir(&self, root: &Path, run_id: &RunId) -> PathBuf {
        root.join("saved_model").join(&self.name).join(run_id)
    }

    /// Checkpointing with tracking needs a stable id to resume the same
    /// tracked run; a generated id changes on every invocation.
    pub fn needs_run_id_warning(&self, explicit_id: bool) -> bool {
        self.checkpoints_enabled() && self.use_tracking && !explicit_id
    }

    /// Number of input features once a sample is flattened.
    pub fn input_features(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// Check the configuration for values the training loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.input_shape.is_empty() || self.input_shape.contains(&0) {
            return Err(ConfigError::invalid(
                "input_shape",
                "must be non-empty with positive dimensions",
            ));
        }
        if self.output_shape == 0 {
            return Err(ConfigError::invalid("output_shape", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid("epochs", "must be positive"));
        }
        if self.metrics.is_empty() {
            return Err(ConfigError::invalid("metrics", "at least one metric is required"));
        }
        if self.max_to_keep == 0 {
            return Err(ConfigError::invalid("max_to_keep", "must be positive"));
        }
        if self.log_every == 0 {
            return Err(ConfigError::invalid("log_every", "must be positive"));
        }
        let learning_rate = self.optimizer.learning_rate();
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(ConfigError::invalid(
                "optimizer.learning_rate",
                "must be positive",
            ));
        }
        for metric in &self.metrics {
            if let MetricKind::TopKCategoricalAccuracy { k } = metric {
                if *k == 0 || *k > self.output_shape {
                    return Err(ConfigError::invalid(
                        "metrics.k",
                        format!("must be between 1 and {}", self.output_shape),
                    ));
                }
            }
        }
        self.validate_layers()
    }

    fn validate_layers(&self) -> Result<(), ConfigError> {
        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerConfig::Dense { units: 0, .. } => {
                    return Err(ConfigError::invalid(
                        format!("layers[{index}].units"),
                        "must be positive",
                    ));
                }
                LayerConfig::Dropout { rate } if !(0.0..1.0).contains(rate) => {
                    return Err(ConfigError::invalid(
                        format!("layers[{index}].rate"),
                        "must be in [0, 1)",
                    ));
                }
                _ => {}
            }
        }

        match self.layers.last() {
            Some(LayerConfig::Dense { units, activation }) => {
                if *units != self.output_shape {
                    return Err(ConfigError::invalid(
                        "layers",
                        format!(
                            "output layer has {units} units but output_shape is {}",
                            self.output_shape
                        ),
                    ));
                }
                if !matches!(activation, Activation::Softmax | Activation::Linear) {
                    return Err(ConfigError::invalid(
                        "layers",
                        "output layer activation must be softmax or linear",
                    ));
                }
                Ok(())
            }
            _ => Err(ConfigError::invalid(
                "layers",
                "the last layer must be a dense output layer",
            )),
        }
    }

    /// Render as TOML, e.g. for `theia config init`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("config", e.to_string()))
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (CLI flags)
/// 2. Environment variables (prefixed with `THEIA_`, `__` for nesting)
/// 3. Explicit config file (`--config`, TOML or `.json`)
/// 4. Workspace-local config (`theia.toml`)
/// 5. User config (`~/.config/theia/config.toml`, see [`user_config_path`])
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TheiaConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TheiaConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["config_home"]).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TheiaConfig = figment.extract().map_err(Box::new)?;
    tracing::debug!(name = %config.name, epochs = config.epochs, "Configuration loaded");
    Ok(config)
}

/// `~/.config/theia/config.toml` on Linux, platform equivalent elsewhere.
/// `THEIA_CONFIG_HOME` replaces the directory.
pub fn user_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_HOME_ENV) {
        return Some(PathBuf::from(dir).join("config.toml"));
    }
    directories::ProjectDirs::from("dev", "theia", "theia")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TheiaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.name, "mnist-handwriting");
        assert_eq!(config.input_features(), 784);
        assert_eq!(config.optimizer.learning_rate(), 0.001);
        assert!(config.checkpoints_enabled());
    }

    #[test]
    fn test_run_paths() {
        let config = TheiaConfig::default();
        let id = RunId::new("dense").unwrap();
        assert_eq!(
            config.run_checkpoint_dir(&id),
            PathBuf::from("history/checkpoints/mnist-handwriting/dense")
        );
        assert_eq!(
            config.best_checkpoint_dir(&id),
            PathBuf::from("history/checkpoints/checkpoints/dense")
        );
        assert_eq!(
            config.saved_model_dir(Path::new("out"), &id),
            PathBuf::from("out/saved_model/mnist-handwriting/dense")
        );
    }

    #[test]
    fn test_run_id_warning() {
        let mut config = TheiaConfig::default();
        assert!(config.needs_run_id_warning(false));
        assert!(!config.needs_run_id_warning(true));
        config.use_tracking = false;
        assert!(!config.needs_run_id_warning(false));
        config.use_tracking = true;
        config.checkpoint_state = CheckpointState::NoCheckpoint;
        assert!(!config.needs_run_id_warning(false));
    }

    #[test]
    fn test_validate_rejects_zero_epochs() {
        let config = TheiaConfig {
            epochs: 0,
            ..TheiaConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "epochs"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_counts_and_empty_metrics() {
        let cases = [
            (
                "max_to_keep",
                TheiaConfig {
                    max_to_keep: 0,
                    ..TheiaConfig::default()
                },
            ),
            (
                "log_every",
                TheiaConfig {
                    log_every: 0,
                    ..TheiaConfig::default()
                },
            ),
            (
                "metrics",
                TheiaConfig {
                    metrics: Vec::new(),
                    ..TheiaConfig::default()
                },
            ),
        ];
        for (expected, config) in cases {
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue { field, .. }) if field == expected
            ));
        }
    }

    #[test]
    fn test_validate_rejects_non_finite_learning_rate() {
        for learning_rate in [f64::NAN, f64::INFINITY, 0.0, -0.1] {
            let config = TheiaConfig {
                optimizer: OptimizerConfig::Sgd {
                    learning_rate,
                    momentum: 0.0,
                    nesterov: false,
                },
                ..TheiaConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue { field, .. }) if field == "optimizer.learning_rate"
            ));
        }
    }

    #[test]
    fn test_validate_rejects_mismatched_output_layer() {
        let mut config = TheiaConfig::default();
        config.output_shape = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hidden_output_activation() {
        let mut config = TheiaConfig::default();
        config.layers.pop();
        config.layers.push(LayerConfig::Dense {
            units: 10,
            activation: Activation::Relu,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        let mut config = TheiaConfig::default();
        config.layers.insert(2, LayerConfig::Dropout { rate: 1.0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_large_top_k() {
        let mut config = TheiaConfig::default();
        config
            .metrics
            .push(MetricKind::TopKCategoricalAccuracy { k: 11 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TheiaConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed: TheiaConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_tagged_layers_parse() {
        let parsed: TheiaConfig = toml::from_str(
            r#"
            name = "tiny"
            input_shape = [4]
            output_shape = 3
            batch_size = 2
            epochs = 1
            checkpoint_state = "no_checkpoint"
            checkpoint_dir = "ckpt"
            save_dir = "saved"
            loss = "sparse_categorical_crossentropy"
            metrics = [{ type = "top_k_categorical_accuracy", k = 2 }]

            [optimizer]
            type = "sgd"
            learning_rate = 0.1
            momentum = 0.9

            [[layers]]
            type = "dense"
            units = 3
            activation = "softmax"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.optimizer.learning_rate(), 0.1);
        assert_eq!(parsed.metrics, vec![MetricKind::TopKCategoricalAccuracy { k: 2 }]);
        assert!(parsed.use_tracking);
        assert_eq!(parsed.max_to_keep, 5);
        parsed.validate().unwrap();
    }
}
