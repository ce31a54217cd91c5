//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::TrainArgs;
use anyhow::Context;
use candle_core::{D, Tensor};
use std::path::{Path, PathBuf};
use theia_core::config::WORKSPACE_CONFIG_FILE;
use theia_core::{CheckpointState, ConfigOverrides, RunId, TheiaConfig, console, load_config};
use theia_ml::checkpoint::CheckpointManager;
use theia_ml::data::{Split, load_idx_images};
use theia_ml::tracking::list_runs;
use theia_ml::{Dataset, TrainingRunner};

/// Handle a CLI subcommand.
pub fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args, workspace, config_file),
        Commands::Evaluate { id, data_dir, limit } => {
            handle_evaluate(&id, &data_dir, limit, workspace, config_file)
        }
        Commands::Predict {
            id,
            images,
            limit,
            batch_size,
        } => handle_predict(&id, &images, limit, batch_size, workspace, config_file),
        Commands::Checkpoints { id } => handle_checkpoints(&id, workspace, config_file),
        Commands::Runs => handle_runs(workspace, config_file),
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

/// Load the layered configuration and anchor its relative directories at
/// the workspace.
fn resolve_config(
    workspace: &Path,
    config_file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<TheiaConfig> {
    let mut config = load_config(Some(workspace), config_file, Some(overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for dir in [
        &mut config.checkpoint_dir,
        &mut config.save_dir,
        &mut config.tracking_dir,
    ] {
        if dir.is_relative() {
            *dir = workspace.join(&*dir);
        }
    }
    Ok(config)
}

/// Overrides for commands that only read a finished run: no tracker and no
/// checkpoint manager.
fn inspect_overrides(id: &str) -> ConfigOverrides {
    ConfigOverrides {
        id: Some(id.to_string()),
        use_tracking: Some(false),
        checkpoint_state: Some(CheckpointState::NoCheckpoint),
        show_progress: Some(false),
        ..ConfigOverrides::default()
    }
}

fn load_split(
    data_dir: &Path,
    split: Split,
    config: &TheiaConfig,
    limit: Option<usize>,
) -> anyhow::Result<Dataset> {
    let mut dataset = Dataset::mnist(data_dir, split)
        .with_context(|| format!("Failed to load MNIST from {}", data_dir.display()))?
        .with_sample_shape(&config.input_shape)?;
    if let Some(limit) = limit {
        dataset = dataset.take(limit);
    }
    Ok(dataset)
}

fn handle_train(
    args: TrainArgs,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        id: args.id,
        epochs: args.epochs,
        batch_size: args.batch_size,
        use_tracking: args.no_tracking.then_some(false),
        checkpoint_state: args.no_checkpoint.then_some(CheckpointState::NoCheckpoint),
        save_dir: args.save_dir,
        show_progress: args.no_progress.then_some(false),
    };
    tracing::debug!(?overrides, "CLI overrides");
    let config = resolve_config(workspace, config_file, &overrides)?;

    let train_ds = load_split(&args.data_dir, Split::Train, &config, args.limit)?;
    let val_ds = load_split(&args.data_dir, Split::Test, &config, args.limit)?;

    let mut runner = TrainingRunner::new(config.clone(), None)?;
    if args.keep_best {
        runner.add_checkpoint_callback()?;
    }

    let metrics = runner.train(&train_ds, &val_ds)?;
    runner.save(&config.save_dir)?;

    if let (Some(epoch), Some(loss)) = (metrics.best_epoch, metrics.best_loss) {
        console::info(format!("Best epoch: {epoch} (loss {loss:.4})"));
    }
    console::info(format!("Run id: {}", runner.run_id()));
    Ok(())
}

fn handle_evaluate(
    id: &str,
    data_dir: &Path,
    limit: Option<usize>,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = resolve_config(workspace, config_file, &inspect_overrides(id))?;
    let mut runner = TrainingRunner::new(config.clone(), None)?;
    let weights = runner.saved_weights_path(&config.save_dir);
    runner
        .load_weights(&weights)
        .with_context(|| format!("No saved model for run {id}"))?;

    let test_ds = load_split(data_dir, Split::Test, &config, limit)?;
    let logs = runner.evaluate(&test_ds)?;
    for (name, value) in &logs {
        println!("{name}: {value:.4}");
    }
    Ok(())
}

fn handle_predict(
    id: &str,
    images: &Path,
    limit: Option<usize>,
    batch_size: Option<usize>,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = resolve_config(workspace, config_file, &inspect_overrides(id))?;
    let mut runner = TrainingRunner::new(config.clone(), None)?;
    let weights = runner.saved_weights_path(&config.save_dir);
    runner
        .load_weights(&weights)
        .with_context(|| format!("No saved model for run {id}"))?;

    let (sample_shape, mut pixels) = load_idx_images(images)
        .with_context(|| format!("Failed to read {}", images.display()))?;
    let sample_len: usize = sample_shape.iter().product();
    if sample_len != config.input_features() {
        anyhow::bail!(
            "Images have shape {:?}, the model expects {:?}",
            sample_shape,
            config.input_shape
        );
    }
    let mut count = pixels.len() / sample_len;
    if let Some(limit) = limit {
        count = count.min(limit);
        pixels.truncate(count * sample_len);
    }

    let mut shape = vec![count];
    shape.extend_from_slice(&config.input_shape);
    let batch = Tensor::from_vec(pixels, shape, runner.device())?;
    let probabilities = runner.predict(&batch, batch_size)?;
    let classes = probabilities.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let confidence = probabilities.max(D::Minus1)?.to_vec1::<f32>()?;

    for (index, (class, p)) in classes.iter().zip(&confidence).enumerate() {
        println!("{index}: {class} ({p:.3})");
    }
    Ok(())
}

fn handle_checkpoints(
    id: &str,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = resolve_config(workspace, config_file, &ConfigOverrides::default())?;
    let run_id = RunId::new(id)?;
    let manager = CheckpointManager::new(config.run_checkpoint_dir(&run_id), config.max_to_keep);

    let checkpoints = manager.list()?;
    if checkpoints.is_empty() {
        println!(
            "No checkpoints for run {id} in {}",
            manager.directory().display()
        );
        return Ok(());
    }

    println!("Checkpoints for run {id}:");
    for ckpt in checkpoints {
        let loss = ckpt
            .loss
            .map(|l| format!("{l:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} epoch {:>3}  step {:>7}  loss {:>8}  {}  {}",
            ckpt.dir_name,
            ckpt.epoch + 1,
            ckpt.step,
            loss,
            ckpt.optimizer_kind,
            ckpt.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn handle_runs(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = resolve_config(workspace, config_file, &ConfigOverrides::default())?;
    let runs = list_runs(&config.tracking_dir, &config.name)?;
    if runs.is_empty() {
        println!("No tracked runs for {}", config.name);
        return Ok(());
    }

    println!("Runs of {}:", config.name);
    for run in runs {
        let last = run
            .last_step
            .map(|s| (s + 1).to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<30} {:<10} epochs {:>4}  resumed {}x  {}",
            run.run_id,
            format!("{:?}", run.status).to_lowercase(),
            last,
            run.resume_count,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path: PathBuf = workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = TheiaConfig::default().to_toml_string()?;
            std::fs::write(&config_path, &toml_str)?;
            console::created(format!(
                "Created default configuration at: {}",
                config_path.display()
            ));
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", config.to_toml_string()?);
            if let Err(e) = config.validate() {
                console::warn(format!("Configuration is not usable for training: {e}"));
            }
            Ok(())
        }
    }
}
