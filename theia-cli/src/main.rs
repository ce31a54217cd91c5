//! Theia CLI — train, evaluate and inspect image classifiers.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Theia: image-classifier training with checkpoints and run tracking
#[derive(Parser, Debug)]
#[command(name = "theia", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for theia.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (TOML, or JSON with a .json extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train on MNIST, validating on the test split, then save the weights
    Train(TrainArgs),
    /// Report loss and metrics of saved weights on the MNIST test split
    Evaluate {
        #[arg(long)]
        id: String,
        #[arg(short, long)]
        data_dir: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the predicted class of every image in an IDX file
    Predict {
        #[arg(long)]
        id: String,
        /// IDX image file, e.g. t10k-images-idx3-ubyte
        #[arg(long)]
        images: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// List the checkpoints kept for a run
    Checkpoints {
        #[arg(long)]
        id: String,
    },
    /// List tracked runs of the configured model
    Runs,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Directory holding the MNIST IDX files
    #[arg(short, long)]
    data_dir: PathBuf,
    /// Run id; reuse one to resume from its checkpoints
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Print epoch logs instead of writing them to the run store
    #[arg(long)]
    no_tracking: bool,
    /// Disable per-epoch checkpoints
    #[arg(long)]
    no_checkpoint: bool,
    /// Also keep the best epoch's weights by validation loss
    #[arg(long)]
    keep_best: bool,
    /// Use only the first N samples of each split
    #[arg(long)]
    limit: Option<usize>,
    /// Root directory for the saved weights
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to theia.toml in the workspace
    Init,
    /// Print the resolved configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "theia", "theia")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "theia.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace, cli.config.as_deref())
}
