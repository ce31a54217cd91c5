//! End-to-end training tests on a small synthetic dataset.
//!
//! Every test writes into its own temp directory: checkpoints, the tracking
//! store and saved weights never touch the working tree.

use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;
use theia_core::{
    Activation, CallbackConfig, CheckpointState, LayerConfig, OptimizerConfig, TheiaConfig,
};
use theia_ml::callbacks::{Callback, CallbackAction, Logs};
use theia_ml::tracking::list_runs;
use theia_ml::{Dataset, MlError, TrainingRunner, TrainingStatus};

// ── Fixtures ─────────────────────────────────────────────────────────────

/// Two linearly separable classes of four features.
fn dataset(n: usize) -> Dataset {
    let mut images = Vec::with_capacity(n * 4);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let jitter = (i % 5) as f32 * 0.02;
        let class = (i % 2) as u32;
        let sample = if class == 0 {
            [0.9 - jitter, 0.8, 0.1 + jitter, 0.0]
        } else {
            [0.1, 0.0 + jitter, 0.9, 0.8 - jitter]
        };
        images.extend_from_slice(&sample);
        labels.push(class);
    }
    Dataset::new(images, labels, vec![4]).unwrap()
}

fn config(root: &Path) -> TheiaConfig {
    TheiaConfig {
        name: "toy".to_string(),
        input_shape: vec![4],
        output_shape: 2,
        use_tracking: false,
        optimizer: OptimizerConfig::Adam {
            learning_rate: 0.05,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        },
        batch_size: 8,
        epochs: 2,
        callbacks: vec![CallbackConfig::EpochLogger],
        checkpoint_state: CheckpointState::NoCheckpoint,
        checkpoint_dir: root.join("checkpoints"),
        save_dir: root.join("saved"),
        tracking_dir: root.join("runs"),
        show_progress: false,
        layers: vec![
            LayerConfig::Flatten,
            LayerConfig::Dense {
                units: 8,
                activation: Activation::Relu,
            },
            LayerConfig::Dense {
                units: 2,
                activation: Activation::Softmax,
            },
        ],
        ..TheiaConfig::default()
    }
}

struct StopAfter(usize);

impl Callback for StopAfter {
    fn name(&self) -> &str {
        "stop_after"
    }

    fn on_epoch_end(&mut self, epoch: usize, _logs: &Logs) -> theia_ml::Result<CallbackAction> {
        if epoch + 1 >= self.0 {
            Ok(CallbackAction::Stop)
        } else {
            Ok(CallbackAction::Continue)
        }
    }
}

// ── Training ─────────────────────────────────────────────────────────────

#[test]
fn test_training_learns_separable_data() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.epochs = 15;
    let mut runner = TrainingRunner::new(cfg, Some("learn")).unwrap();

    let metrics = runner.train(&dataset(64), &dataset(16)).unwrap();
    assert_eq!(metrics.epochs_completed, 15);
    assert_eq!(metrics.val_loss_history.len(), 15);
    let first = metrics.loss_history[0];
    let last = *metrics.loss_history.last().unwrap();
    assert!(last < first, "loss should fall: {first} -> {last}");

    let logs = runner.evaluate(&dataset(16)).unwrap();
    assert!(logs["categorical_accuracy"] > 0.9, "{logs:?}");
    assert!(logs.contains_key("loss"));
    assert_eq!(
        metrics.custom_metrics["val_categorical_accuracy"].len(),
        15
    );
}

#[test]
fn test_callback_stop_ends_training_early() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.epochs = 10;
    cfg.use_tracking = true;
    let mut runner = TrainingRunner::new(cfg, Some("early")).unwrap();
    runner.add_callback(Box::new(StopAfter(2)));

    let metrics = runner.train(&dataset(32), &dataset(8)).unwrap();
    assert_eq!(metrics.epochs_completed, 2);

    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, TrainingStatus::Stopped);
    assert_eq!(runs[0].last_step, Some(1));
}

#[test]
fn test_rejects_mismatched_samples() {
    let dir = TempDir::new().unwrap();
    let mut runner = TrainingRunner::new(config(dir.path()), Some("shape")).unwrap();
    let wrong = Dataset::new(vec![0.0; 6], vec![0, 1], vec![3]).unwrap();
    assert!(matches!(
        runner.train(&wrong, &dataset(4)),
        Err(MlError::Dataset(_))
    ));

    let bad_label = Dataset::new(vec![0.0; 4], vec![7], vec![4]).unwrap();
    assert!(runner.train(&dataset(4), &bad_label).is_err());
}

// ── Checkpoints and tracking ─────────────────────────────────────────────

#[test]
fn test_resume_from_checkpoint_continues_run() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.checkpoint_state = CheckpointState::Epoch;
    cfg.use_tracking = true;

    let mut first = TrainingRunner::new(cfg.clone(), Some("resume-run")).unwrap();
    first.train(&dataset(32), &dataset(8)).unwrap();
    let manager = first.checkpoint_manager().unwrap();
    assert_eq!(manager.list().unwrap().len(), 2);
    assert!(
        dir.path()
            .join("checkpoints")
            .join("toy")
            .join("resume-run")
            .join("checkpoints.json")
            .exists()
    );

    cfg.epochs = 4;
    let mut second = TrainingRunner::new(cfg, Some("resume-run")).unwrap();
    let metrics = second.train(&dataset(32), &dataset(8)).unwrap();

    // Epochs 0 and 1 came from the checkpoint.
    assert_eq!(metrics.epochs_completed, 2);
    assert_eq!(second.optimizer().iterations(), 4 * 4);
    let latest = second.checkpoint_manager().unwrap().latest().unwrap().unwrap();
    assert_eq!(latest.epoch, 3);

    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].resume_count, 1);
    assert_eq!(runs[0].status, TrainingStatus::Completed);
    assert_eq!(runs[0].last_step, Some(3));
}

#[test]
fn test_finished_run_does_not_retrain() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.checkpoint_state = CheckpointState::Epoch;

    let mut first = TrainingRunner::new(cfg.clone(), Some("done")).unwrap();
    first.train(&dataset(16), &dataset(4)).unwrap();

    let mut again = TrainingRunner::new(cfg, Some("done")).unwrap();
    let metrics = again.train(&dataset(16), &dataset(4)).unwrap();
    assert_eq!(metrics.epochs_completed, 0);
    assert_eq!(again.optimizer().iterations(), first.optimizer().iterations());
}

#[test]
fn test_finished_tracked_run_stays_completed() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.checkpoint_state = CheckpointState::Epoch;
    cfg.use_tracking = true;

    TrainingRunner::new(cfg.clone(), Some("done"))
        .unwrap()
        .train(&dataset(16), &dataset(4))
        .unwrap();
    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs[0].status, TrainingStatus::Completed);

    let metrics = TrainingRunner::new(cfg, Some("done"))
        .unwrap()
        .train(&dataset(16), &dataset(4))
        .unwrap();
    assert_eq!(metrics.epochs_completed, 0);

    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, TrainingStatus::Completed);
    assert_eq!(runs[0].resume_count, 1);
    assert_eq!(runs[0].last_step, Some(1));
}

#[test]
fn test_tracking_without_checkpoint_starts_fresh_run_per_invocation() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.use_tracking = true;

    let mut first = TrainingRunner::new(cfg.clone(), Some("once")).unwrap();
    first.train(&dataset(16), &dataset(4)).unwrap();
    let mut second = TrainingRunner::new(cfg, Some("once")).unwrap();
    second.train(&dataset(16), &dataset(4)).unwrap();

    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|run| run.run_id == "once"));
    assert!(runs.iter().any(|run| run.run_id.starts_with("once_")));
    assert!(runs.iter().all(|run| run.resume_count == 0));
    assert!(runs.iter().all(|run| run.status == TrainingStatus::Completed));
}

#[test]
fn test_nan_loss_terminates_and_fails_run() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.epochs = 3;
    cfg.use_tracking = true;
    cfg.checkpoint_state = CheckpointState::Epoch;
    cfg.callbacks = vec![CallbackConfig::TerminateOnNan];

    let poisoned = Dataset::new(vec![f32::NAN; 16 * 4], vec![0; 16], vec![4]).unwrap();
    let mut runner = TrainingRunner::new(cfg, Some("nan")).unwrap();
    let metrics = runner.train(&poisoned, &dataset(4)).unwrap();

    // Stopped after the first batch, before any epoch ended.
    assert_eq!(metrics.epochs_completed, 0);
    assert_eq!(runner.optimizer().iterations(), 1);
    assert!(runner.checkpoint_manager().unwrap().list().unwrap().is_empty());

    let runs = list_runs(&dir.path().join("runs"), "toy").unwrap();
    assert_eq!(runs[0].status, TrainingStatus::Failed);
    assert_eq!(runs[0].last_step, None);
}

#[test]
fn test_best_model_checkpoint_callback() {
    let dir = TempDir::new().unwrap();
    let mut runner = TrainingRunner::new(config(dir.path()), Some("best")).unwrap();
    let best_dir = runner.add_checkpoint_callback().unwrap();
    assert_eq!(
        best_dir,
        dir.path().join("checkpoints").join("checkpoints").join("best")
    );

    runner.train(&dataset(32), &dataset(8)).unwrap();
    let files: Vec<_> = std::fs::read_dir(&best_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(!files.is_empty());
    assert!(files.iter().all(|f| f.ends_with(".safetensors")));
    assert!(files.iter().any(|f| f.starts_with("01-")));
}

// ── Save, load, predict ──────────────────────────────────────────────────

#[test]
fn test_save_load_predict() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let mut trained = TrainingRunner::new(cfg.clone(), Some("saved")).unwrap();
    trained.train(&dataset(32), &dataset(8)).unwrap();

    let path = trained.save(&cfg.save_dir).unwrap();
    assert_eq!(
        path,
        dir.path()
            .join("saved")
            .join("saved_model")
            .join("toy")
            .join("saved")
            .join("model.safetensors")
    );
    assert_eq!(path, trained.saved_weights_path(&cfg.save_dir));

    let images = dataset(10).images_tensor(trained.device()).unwrap();
    let expected = trained.predict(&images, Some(3)).unwrap();
    assert_eq!(expected.dims(), &[10, 2]);

    let mut loaded = TrainingRunner::new(cfg, Some("saved")).unwrap();
    loaded.load_weights(&path).unwrap();
    let actual = loaded.predict(&images, None).unwrap();

    let expected = expected.to_vec2::<f32>().unwrap();
    let actual = actual.to_vec2::<f32>().unwrap();
    for (a, b) in expected.iter().zip(&actual) {
        assert!((a[0] - b[0]).abs() < 1e-6 && (a[1] - b[1]).abs() < 1e-6);
        assert!((a[0] + a[1] - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_load_missing_weights() {
    let dir = TempDir::new().unwrap();
    let mut runner = TrainingRunner::new(config(dir.path()), None).unwrap();
    assert!(matches!(
        runner.load_weights(&dir.path().join("absent.safetensors")),
        Err(MlError::NotFound(_))
    ));
}
