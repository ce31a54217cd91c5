//! Training runner: owns the model and drives the epoch/batch loop.

use crate::callbacks::{
    self, Callback, CallbackAction, History, Logs, ModelCheckpoint, TrackingCallback,
};
use crate::checkpoint::CheckpointManager;
use crate::data::{Batch, Dataset};
use crate::error::{MlError, Result};
use crate::loss::Loss;
use crate::metrics::{Mean, MetricSet, TrainingMetrics};
use crate::network::Network;
use crate::optim::TrainableOptimizer;
use crate::tracking::{LocalTracker, Resume, Tracker};
use crate::training::progress::TrainingProgress;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use theia_core::{RunId, TheiaConfig, console};

const WEIGHTS_FILE: &str = "model.safetensors";

/// A configured model together with everything needed to train it.
pub struct TrainingRunner {
    config: TheiaConfig,
    run_id: RunId,
    device: Device,
    varmap: VarMap,
    network: Network,
    optimizer: TrainableOptimizer,
    loss: Loss,
    metrics: MetricSet,
    loss_mean: Mean,
    callbacks: callbacks::CallbackList,
    configured_callbacks_added: bool,
    checkpoints: Option<CheckpointManager>,
    tracking: bool,
}

impl TrainingRunner {
    /// Build the model described by `config`.
    ///
    /// `id` names the run; when `None` a timestamped id is generated, which
    /// means checkpoints of an earlier invocation are not picked up.
    pub fn new(config: TheiaConfig, id: Option<&str>) -> Result<Self> {
        config.validate()?;
        let (run_id, explicit) = RunId::resolve(id.or(config.id.as_deref()))?;
        let device = Device::Cpu;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = Network::new(&config, vb)?;
        let optimizer = TrainableOptimizer::from_config(&config.optimizer, &varmap)?;

        let checkpoints = config.checkpoints_enabled().then(|| {
            CheckpointManager::new(config.run_checkpoint_dir(&run_id), config.max_to_keep)
        });

        if config.needs_run_id_warning(explicit) {
            console::warn(
                "Checkpointing is enabled but no id was given. Restarting will not resume this run's checkpoints or tracked metrics.",
            );
        }

        let mut callback_list = callbacks::CallbackList::new(true);
        if config.use_tracking {
            let (resume, mode) = if config.checkpoints_enabled() {
                (Resume::Allow, "USING")
            } else {
                (Resume::Fresh, "WITHOUT")
            };
            let tracker =
                LocalTracker::init(&config.tracking_dir, &config.name, &run_id, resume, &config)?;
            console::success(format!(
                "Tracking initialized with project name: {} and id: {} {mode} checkpoint.",
                config.name,
                tracker.run_id()
            ));
            callback_list.append(Box::new(TrackingCallback::new(
                Box::new(tracker),
                config.epochs,
            )));
        }

        tracing::info!(
            name = %config.name,
            run_id = %run_id,
            optimizer = optimizer.name(),
            layers = config.layers.len(),
            "Model created"
        );
        console::created(format!("Model created: {}", config.name));

        Ok(Self {
            loss: Loss::new(config.loss),
            metrics: MetricSet::from_config(&config.metrics),
            loss_mean: Mean::new(),
            tracking: config.use_tracking,
            callbacks: callback_list,
            configured_callbacks_added: false,
            config,
            run_id,
            device,
            varmap,
            network,
            optimizer,
            checkpoints,
        })
    }

    pub fn config(&self) -> &TheiaConfig {
        &self.config
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &TrainableOptimizer {
        &self.optimizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn callbacks(&self) -> &callbacks::CallbackList {
        &self.callbacks
    }

    pub fn checkpoint_manager(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    fn check_dataset(&self, dataset: &Dataset, role: &str) -> Result<()> {
        let input_shape = self.network.input_shape();
        if dataset.sample_len() != input_shape.iter().product::<usize>() {
            return Err(MlError::dataset(format!(
                "{role} samples have shape {:?}, the model expects {input_shape:?}",
                dataset.sample_shape()
            )));
        }
        let classes = self.network.num_classes();
        if let Some(&label) = dataset
            .labels()
            .iter()
            .find(|&&label| label as usize >= classes)
        {
            return Err(MlError::dataset(format!(
                "{role} label {label} out of range for {classes} classes"
            )));
        }
        Ok(())
    }

    /// Restore the latest checkpoint when checkpointing is on. Returns the
    /// epoch to start from.
    fn restore_checkpoint(&mut self) -> Result<usize> {
        let Some(manager) = &self.checkpoints else {
            return Ok(0);
        };
        match manager.restore_or_initialize(&mut self.varmap, &mut self.optimizer)? {
            Some(checkpoint) => {
                console::info("Model restored from checkpoint.");
                Ok(checkpoint.epoch + 1)
            }
            None => Ok(0),
        }
    }

    fn refresh_logs(&self, logs: &mut Logs, prefix: &str) {
        logs.insert(format!("{prefix}loss"), self.loss_mean.result());
        logs.extend(self.metrics.results(prefix));
    }

    /// Train on `train_ds`, validating on `val_ds` after every epoch.
    pub fn train(&mut self, train_ds: &Dataset, val_ds: &Dataset) -> Result<TrainingMetrics> {
        if train_ds.is_empty() {
            return Err(MlError::dataset("training dataset is empty"));
        }
        self.check_dataset(train_ds, "training")?;
        self.check_dataset(val_ds, "validation")?;

        if !self.configured_callbacks_added {
            for callback in callbacks::from_config(&self.config, &self.run_id) {
                self.callbacks.append(callback);
            }
            self.configured_callbacks_added = true;
        }
        self.callbacks.set_model(&self.varmap);

        let start_epoch = self.restore_checkpoint()?;
        let epochs = self.config.epochs;
        let batch_size = self.config.batch_size;
        let log_every = self.config.log_every.max(1);
        // Batches borrow the device while the steps borrow `self` mutably.
        let device = self.device.clone();
        let started = Instant::now();

        let mut logs = Logs::new();
        self.metrics.reset_states();
        self.loss_mean.reset();
        self.refresh_logs(&mut logs, "");
        let mut train_line = self.metrics.format_line("", 0.0);

        self.callbacks.on_train_begin(&logs)?;

        if self.tracking {
            console::info(
                "Using tracking, every log will be written to the run store and will not be printed on the console.",
            );
        } else {
            console::info("Not using tracking, every log will be printed to the console.");
        }

        let train_batches = train_ds.num_batches(batch_size);
        let val_batches = val_ds.num_batches(batch_size);
        let per_epoch = (train_batches + val_batches) as u64;
        let progress = TrainingProgress::new(per_epoch * epochs as u64, self.config.show_progress);
        progress.set_position(per_epoch * start_epoch.min(epochs) as u64);
        progress.set_text(&train_line);

        if start_epoch >= epochs {
            tracing::info!(run_id = %self.run_id, epochs, "All epochs already trained");
        }

        'epochs: for epoch in start_epoch..epochs {
            self.callbacks.on_epoch_begin(epoch, &logs)?;
            progress.set_title(format!("Epoch {}/{}", epoch + 1, epochs));

            self.metrics.reset_states();
            self.loss_mean.reset();
            let shuffle_seed = self.config.seed.wrapping_add(epoch as u64);
            for (batch, item) in train_ds
                .batches(batch_size, Some(shuffle_seed), &device)
                .enumerate()
            {
                let Batch { images, labels } = item?;
                self.callbacks.on_batch_begin(batch, &logs)?;
                self.callbacks.on_train_batch_begin(batch, &logs)?;

                let (loss, _) = self.train_step(&images, &labels)?;
                self.loss_mean.update(loss);
                self.refresh_logs(&mut logs, "");
                if refreshes_line(batch, log_every, train_batches) {
                    train_line = self.metrics.format_line("", self.loss_mean.result());
                    progress.set_text(&train_line);
                }
                progress.tick();

                let action = self.callbacks.on_train_batch_end(batch, &logs)?;
                self.callbacks.on_batch_end(batch, &logs)?;
                if action == CallbackAction::Stop {
                    tracing::warn!(epoch = epoch + 1, batch, "Training stopped mid-epoch");
                    break 'epochs;
                }
            }

            self.metrics.reset_states();
            self.loss_mean.reset();
            let mut val_line = self.metrics.format_line("val_", 0.0);
            for (batch, item) in val_ds.batches(batch_size, None, &device).enumerate() {
                let Batch { images, labels } = item?;
                self.callbacks.on_batch_begin(batch, &logs)?;
                self.callbacks.on_test_batch_begin(batch, &logs)?;

                let (loss, _) = self.val_step(&images, &labels)?;
                self.loss_mean.update(loss);
                self.refresh_logs(&mut logs, "val_");
                if refreshes_line(batch, log_every, val_batches) {
                    val_line = self.metrics.format_line("val_", self.loss_mean.result());
                    progress.set_text(&val_line);
                }
                progress.tick();

                self.callbacks.on_test_batch_end(batch, &logs)?;
                self.callbacks.on_batch_end(batch, &logs)?;
            }

            if !self.tracking {
                progress.println(format!("epoch {}: {train_line} {val_line}", epoch + 1));
            }

            if let Some(manager) = &self.checkpoints {
                let monitored = logs.get("val_loss").or_else(|| logs.get("loss")).copied();
                manager.save(epoch, &self.varmap, &self.optimizer, monitored)?;
            }

            if self.callbacks.on_epoch_end(epoch, &logs)? == CallbackAction::Stop {
                tracing::info!(epoch = epoch + 1, "Training stopped by callback");
                break;
            }
        }

        progress.finish();
        self.callbacks.on_train_end(&logs)?;

        let mut metrics = self
            .callbacks
            .history()
            .map(History::to_training_metrics)
            .unwrap_or_default();
        metrics.total_training_time_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            run_id = %self.run_id,
            epochs = metrics.epochs_completed,
            secs = metrics.total_training_time_secs,
            "Training finished"
        );
        Ok(metrics)
    }

    /// One optimisation step. Returns the batch loss and the logits.
    pub fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<(f64, Tensor)> {
        let logits = self.network.logits(images, true)?;
        let loss = self.loss.compute(&logits, labels)?;
        self.metrics.update_state(labels, &logits)?;
        self.optimizer.backward_step(&loss)?;
        Ok((f64::from(loss.to_scalar::<f32>()?), logits))
    }

    /// Loss and metric update without touching the weights.
    pub fn val_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<(f64, Tensor)> {
        let logits = self.network.logits(images, false)?;
        let loss = self.loss.compute(&logits, labels)?;
        self.metrics.update_state(labels, &logits)?;
        Ok((f64::from(loss.to_scalar::<f32>()?), logits))
    }

    /// Mean loss and metrics over `dataset`, keyed without a prefix.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<Logs> {
        if dataset.is_empty() {
            return Err(MlError::dataset("evaluation dataset is empty"));
        }
        self.check_dataset(dataset, "evaluation")?;

        self.metrics.reset_states();
        self.loss_mean.reset();
        let device = self.device.clone();
        for item in dataset.batches(self.config.batch_size, None, &device) {
            let Batch { images, labels } = item?;
            let (loss, _) = self.val_step(&images, &labels)?;
            self.loss_mean.update(loss);
        }

        let mut logs = Logs::new();
        self.refresh_logs(&mut logs, "");
        tracing::info!(run_id = %self.run_id, samples = dataset.len(), ?logs, "Evaluated");
        Ok(logs)
    }

    /// Write the weights to `<dir>/saved_model/<name>/<run id>/model.safetensors`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let model_dir = self.config.saved_model_dir(dir, &self.run_id);
        std::fs::create_dir_all(&model_dir)?;
        let path = model_dir.join(WEIGHTS_FILE);
        self.varmap.save(&path)?;
        console::success(format!("Model saved to {}", model_dir.display()));
        Ok(path)
    }

    /// Path [`save`](Self::save) writes to for this run.
    pub fn saved_weights_path(&self, dir: &Path) -> PathBuf {
        self.config
            .saved_model_dir(dir, &self.run_id)
            .join(WEIGHTS_FILE)
    }

    /// Load weights written by [`save`](Self::save) or by a model checkpoint.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(MlError::not_found(format!("{}", path.display())));
        }
        self.varmap.load(path)?;
        tracing::info!(path = %path.display(), "Loaded weights");
        Ok(())
    }

    /// Register an extra callback, called after the built-in ones.
    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.append(callback);
    }

    /// Keep the weights of the best epoch by validation loss under
    /// `<checkpoint_dir>/checkpoints/<run id>`.
    pub fn add_checkpoint_callback(&mut self) -> Result<PathBuf> {
        let dir = self.config.best_checkpoint_dir(&self.run_id);
        std::fs::create_dir_all(&dir)?;
        self.callbacks
            .append(Box::new(ModelCheckpoint::new(dir.clone(), "val_loss")));
        console::info(format!(
            "Checkpoint callback added. The model will be saved every epoch in {}.",
            self.config.checkpoint_dir.display()
        ));
        Ok(dir)
    }

    /// Class probabilities for `images`, `[n, ..input_shape]`, computed in
    /// batches of `batch_size` (the configured batch size by default).
    pub fn predict(&self, images: &Tensor, batch_size: Option<usize>) -> Result<Tensor> {
        let batch_size = batch_size.unwrap_or(self.config.batch_size).max(1);
        let total = images.dim(0)?;
        if total == 0 {
            return Err(MlError::invalid_input("no images to predict"));
        }

        let mut outputs = Vec::with_capacity(total.div_ceil(batch_size));
        let mut start = 0;
        while start < total {
            let len = batch_size.min(total - start);
            let batch = images.narrow(0, start, len)?;
            outputs.push(self.network.forward(&batch, false)?);
            start += len;
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

/// Whether the metric line is rebuilt after `batch`: the first batch, every
/// `log_every` batches and the last one.
fn refreshes_line(batch: usize, log_every: usize, batches: usize) -> bool {
    batch % log_every == 0 || batch + 1 == batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_line_refresh_cadence() {
        let refreshed: Vec<usize> = (0..12).filter(|&b| refreshes_line(b, 5, 12)).collect();
        assert_eq!(refreshed, vec![0, 5, 10, 11]);

        let every: Vec<usize> = (0..3).filter(|&b| refreshes_line(b, 1, 3)).collect();
        assert_eq!(every, vec![0, 1, 2]);

        assert!(refreshes_line(0, 100, 1));
    }
}
