//! Training callbacks — history, epoch logging, early stopping, NaN
//! termination, best-model snapshots and tracking.

use crate::error::Result;
use crate::metrics::TrainingMetrics;
use crate::tracking::{Tracker, TrainingStatus};
use candle_nn::VarMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use theia_core::{CallbackConfig, RunId, TheiaConfig};

/// Metric name to latest value, passed to every hook.
pub type Logs = BTreeMap<String, f64>;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hooks invoked by the training loop. Every hook defaults to a no-op.
///
/// `epoch` and `batch` are zero-based.
pub trait Callback: Send {
    fn name(&self) -> &str;

    /// Hand the callback the variables of the model being trained.
    fn set_model(&mut self, _varmap: &VarMap) {}

    fn on_train_begin(&mut self, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize, _logs: &Logs) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_batch_begin(&mut self, _batch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _batch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_begin(&mut self, _batch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(&mut self, _batch: usize, _logs: &Logs) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_test_batch_begin(&mut self, _batch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }

    fn on_test_batch_end(&mut self, _batch: usize, _logs: &Logs) -> Result<()> {
        Ok(())
    }
}

/// Callbacks called in registration order, with an optional built-in history.
pub struct CallbackList {
    history: Option<History>,
    callbacks: Vec<Box<dyn Callback>>,
}

macro_rules! fan_out {
    ($self:ident, $hook:ident ( $($arg:expr),* )) => {{
        if let Some(history) = $self.history.as_mut() {
            history.$hook($($arg),*)?;
        }
        for callback in &mut $self.callbacks {
            callback.$hook($($arg),*)?;
        }
        Ok(())
    }};
}

macro_rules! fold_actions {
    ($self:ident, $hook:ident ( $($arg:expr),* )) => {{
        let mut action = CallbackAction::Continue;
        if let Some(history) = $self.history.as_mut() {
            if history.$hook($($arg),*)? == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }
        for callback in &mut $self.callbacks {
            if callback.$hook($($arg),*)? == CallbackAction::Stop {
                tracing::info!(callback = callback.name(), "Callback requested stop");
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }};
}

impl CallbackList {
    pub fn new(add_history: bool) -> Self {
        Self {
            history: add_history.then(History::new),
            callbacks: Vec::new(),
        }
    }

    pub fn append(&mut self, callback: Box<dyn Callback>) {
        tracing::debug!(callback = callback.name(), "Callback registered");
        self.callbacks.push(callback);
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    /// Names of the registered callbacks, history first.
    pub fn names(&self) -> Vec<String> {
        self.history
            .iter()
            .map(|h| h.name().to_string())
            .chain(self.callbacks.iter().map(|c| c.name().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len() + usize::from(self.history.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_model(&mut self, varmap: &VarMap) {
        if let Some(history) = self.history.as_mut() {
            history.set_model(varmap);
        }
        for callback in &mut self.callbacks {
            callback.set_model(varmap);
        }
    }

    pub fn on_train_begin(&mut self, logs: &Logs) -> Result<()> {
        fan_out!(self, on_train_begin(logs))
    }

    pub fn on_train_end(&mut self, logs: &Logs) -> Result<()> {
        fan_out!(self, on_train_end(logs))
    }

    pub fn on_epoch_begin(&mut self, epoch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_epoch_begin(epoch, logs))
    }

    /// Every callback sees the epoch end; any `Stop` wins.
    pub fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        fold_actions!(self, on_epoch_end(epoch, logs))
    }

    pub fn on_batch_begin(&mut self, batch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_batch_begin(batch, logs))
    }

    pub fn on_batch_end(&mut self, batch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_batch_end(batch, logs))
    }

    pub fn on_train_batch_begin(&mut self, batch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_train_batch_begin(batch, logs))
    }

    pub fn on_train_batch_end(&mut self, batch: usize, logs: &Logs) -> Result<CallbackAction> {
        fold_actions!(self, on_train_batch_end(batch, logs))
    }

    pub fn on_test_batch_begin(&mut self, batch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_test_batch_begin(batch, logs))
    }

    pub fn on_test_batch_end(&mut self, batch: usize, logs: &Logs) -> Result<()> {
        fan_out!(self, on_test_batch_end(batch, logs))
    }
}

/// Records the logs of every finished epoch.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub epochs: Vec<usize>,
    pub history: BTreeMap<String, Vec<f64>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summarise as [`TrainingMetrics`], keyed on `loss` and `val_loss`.
    pub fn to_training_metrics(&self) -> TrainingMetrics {
        let mut metrics = TrainingMetrics::default();
        let losses = self.history.get("loss");
        let val_losses = self.history.get("val_loss");
        for index in 0..self.epochs.len() {
            let loss = losses.and_then(|l| l.get(index)).copied().unwrap_or(f64::NAN);
            let val_loss = val_losses.and_then(|l| l.get(index)).copied();
            metrics.record_epoch(loss, val_loss);
        }
        for (name, values) in &self.history {
            if name == "loss" || name == "val_loss" {
                continue;
            }
            for value in values {
                metrics.add_custom_metric(name, *value);
            }
        }
        metrics
    }
}

impl Callback for History {
    fn name(&self) -> &str {
        "history"
    }

    fn on_train_begin(&mut self, _logs: &Logs) -> Result<()> {
        self.epochs.clear();
        self.history.clear();
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        self.epochs.push(epoch);
        for (name, value) in logs {
            self.history.entry(name.clone()).or_default().push(*value);
        }
        Ok(CallbackAction::Continue)
    }
}

/// Logs every epoch's metrics through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct EpochLogger;

impl Callback for EpochLogger {
    fn name(&self) -> &str {
        "epoch_logger"
    }

    fn on_train_begin(&mut self, _logs: &Logs) -> Result<()> {
        tracing::info!("Training started");
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        let summary = logs
            .iter()
            .map(|(name, value)| format!("{name}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(epoch = epoch + 1, "{summary}");
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self, _logs: &Logs) -> Result<()> {
        tracing::info!("Training finished");
        Ok(())
    }
}

/// Lower is better for losses, higher for everything else.
fn lower_is_better(monitor: &str) -> bool {
    monitor.ends_with("loss")
}

/// Stops training when the monitored value stops improving.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(monitor: impl Into<String>, patience: usize, min_delta: f64) -> Self {
        Self {
            monitor: monitor.into(),
            patience,
            min_delta,
            counter: 0,
            best: None,
        }
    }

    fn improved(&self, current: f64, best: f64) -> bool {
        if lower_is_better(&self.monitor) {
            current < best - self.min_delta
        } else {
            current > best + self.min_delta
        }
    }

    /// Feed one epoch's monitored value.
    pub fn observe(&mut self, value: f64) -> CallbackAction {
        match self.best {
            None => {
                self.best = Some(value);
                CallbackAction::Continue
            }
            Some(best) if self.improved(value, best) => {
                self.best = Some(value);
                self.counter = 0;
                CallbackAction::Continue
            }
            Some(_) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
        }
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_train_begin(&mut self, _logs: &Logs) -> Result<()> {
        self.counter = 0;
        self.best = None;
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        let Some(&value) = logs.get(&self.monitor) else {
            tracing::warn!(monitor = %self.monitor, "Early stopping metric missing from logs");
            return Ok(CallbackAction::Continue);
        };
        let action = self.observe(value);
        if action == CallbackAction::Stop {
            tracing::info!(epoch = epoch + 1, monitor = %self.monitor, "Early stopping");
        }
        Ok(action)
    }
}

/// Stops training as soon as the batch loss is NaN or infinite.
#[derive(Debug, Clone, Default)]
pub struct TerminateOnNan;

impl Callback for TerminateOnNan {
    fn name(&self) -> &str {
        "terminate_on_nan"
    }

    fn on_train_batch_end(&mut self, batch: usize, logs: &Logs) -> Result<CallbackAction> {
        match logs.get("loss") {
            Some(loss) if !loss.is_finite() => {
                tracing::warn!(batch, %loss, "Invalid loss, terminating training");
                Ok(CallbackAction::Stop)
            }
            _ => Ok(CallbackAction::Continue),
        }
    }
}

/// Writes the model weights whenever the monitored value improves.
pub struct ModelCheckpoint {
    directory: PathBuf,
    monitor: String,
    best: Option<f64>,
    best_path: Option<PathBuf>,
    varmap: Option<VarMap>,
}

impl ModelCheckpoint {
    pub fn new(directory: PathBuf, monitor: impl Into<String>) -> Self {
        Self {
            directory,
            monitor: monitor.into(),
            best: None,
            best_path: None,
            varmap: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Weights file of the best epoch so far.
    pub fn best_path(&self) -> Option<&Path> {
        self.best_path.as_deref()
    }

    fn is_improvement(&self, value: f64) -> bool {
        match self.best {
            None => value.is_finite(),
            Some(best) if lower_is_better(&self.monitor) => value < best,
            Some(best) => value > best,
        }
    }
}

impl Callback for ModelCheckpoint {
    fn name(&self) -> &str {
        "model_checkpoint"
    }

    fn set_model(&mut self, varmap: &VarMap) {
        self.varmap = Some(varmap.clone());
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        let Some(&value) = logs.get(&self.monitor) else {
            tracing::warn!(monitor = %self.monitor, "Checkpoint metric missing from logs");
            return Ok(CallbackAction::Continue);
        };
        if !self.is_improvement(value) {
            return Ok(CallbackAction::Continue);
        }
        let Some(varmap) = &self.varmap else {
            tracing::warn!("Model checkpoint has no model attached");
            return Ok(CallbackAction::Continue);
        };

        std::fs::create_dir_all(&self.directory)?;
        let path = self
            .directory
            .join(format!("{:02}-{value:.2}.safetensors", epoch + 1));
        varmap.save(&path)?;
        tracing::info!(epoch = epoch + 1, monitor = %self.monitor, value, path = %path.display(), "Saved best model");

        self.best = Some(value);
        self.best_path = Some(path);
        Ok(CallbackAction::Continue)
    }
}

/// Sends each epoch's logs to a tracker and closes the run at the end.
pub struct TrackingCallback {
    tracker: Box<dyn Tracker>,
    epochs: usize,
    last_epoch: Option<usize>,
}

impl TrackingCallback {
    /// `epochs` is the configured total, used to tell an early stop from
    /// a completed run. A reopened run starts from its last logged step.
    pub fn new(tracker: Box<dyn Tracker>, epochs: usize) -> Self {
        Self {
            last_epoch: tracker.last_step(),
            tracker,
            epochs,
        }
    }
}

impl Callback for TrackingCallback {
    fn name(&self) -> &str {
        "tracking"
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> Result<CallbackAction> {
        self.tracker.log(epoch, logs)?;
        self.last_epoch = Some(epoch);
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self, logs: &Logs) -> Result<()> {
        let finished = self.last_epoch.is_some_and(|epoch| epoch + 1 >= self.epochs);
        let status = if logs.get("loss").is_some_and(|loss| !loss.is_finite()) {
            TrainingStatus::Failed
        } else if finished {
            TrainingStatus::Completed
        } else {
            TrainingStatus::Stopped
        };
        self.tracker.finish(status)
    }
}

/// Instantiate the callbacks named in the configuration.
pub fn from_config(config: &TheiaConfig, run_id: &RunId) -> Vec<Box<dyn Callback>> {
    config
        .callbacks
        .iter()
        .map(|callback| -> Box<dyn Callback> {
            match callback {
                CallbackConfig::EpochLogger => Box::new(EpochLogger),
                CallbackConfig::EarlyStopping {
                    monitor,
                    patience,
                    min_delta,
                } => Box::new(EarlyStopping::new(monitor.clone(), *patience, *min_delta)),
                CallbackConfig::TerminateOnNan => Box::new(TerminateOnNan),
                CallbackConfig::ModelCheckpoint { monitor } => Box::new(ModelCheckpoint::new(
                    config.best_checkpoint_dir(run_id),
                    monitor.clone(),
                )),
            }
        })
        .collect()
}
