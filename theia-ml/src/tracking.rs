//! Experiment tracking.
//!
//! Runs are grouped by project (the model name) and keyed by run id. The
//! local store keeps one directory per run:
//!
//! ```text
//! <root>/<project>/<run_id>/run.json       run metadata and status
//! <root>/<project>/<run_id>/metrics.jsonl  one line per logged step
//! ```

use crate::callbacks::Logs;
use crate::error::{MlError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use theia_core::persistence::{append_json_line, atomic_write_json, load_json, read_json_lines};
use theia_core::{RunId, TheiaConfig};

const RUN_FILE: &str = "run.json";
const METRICS_FILE: &str = "metrics.jsonl";

/// Lifecycle of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

/// What to do when the run directory already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Reopen the existing run and keep appending to it.
    Allow,
    /// Refuse to touch an existing run.
    Never,
    /// Always start a new run. A taken id gets a random suffix.
    Fresh,
}

/// Metadata of a tracked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub project: String,
    pub run_id: String,
    pub status: TrainingStatus,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Times the run was reopened after its first start.
    pub resume_count: usize,
    pub last_step: Option<usize>,
}

/// One logged row of `metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

/// Sink for per-step metrics of one run.
pub trait Tracker: Send {
    fn run_id(&self) -> &str;

    fn log(&mut self, step: usize, logs: &Logs) -> Result<()>;

    fn finish(&mut self, status: TrainingStatus) -> Result<()>;

    /// Last step logged to this run, including earlier sessions.
    fn last_step(&self) -> Option<usize>;
}

/// Tracker backed by files under a local directory.
pub struct LocalTracker {
    run_dir: PathBuf,
    record: RunRecord,
}

impl LocalTracker {
    pub fn init(
        root: &Path,
        project: &str,
        run_id: &RunId,
        resume: Resume,
        config: &TheiaConfig,
    ) -> Result<Self> {
        let mut run_dir = root.join(project).join(run_id);
        let mut run_id = run_id.clone();
        if resume == Resume::Fresh && run_dir.join(RUN_FILE).exists() {
            let fresh = run_id.with_random_suffix();
            tracing::info!(project, taken = %run_id, run_id = %fresh, "Tracked run exists, starting a new one");
            run_dir = root.join(project).join(&fresh);
            run_id = fresh;
        }
        let run_file = run_dir.join(RUN_FILE);
        let now = Utc::now();

        let record = match load_json::<RunRecord>(&run_file)? {
            Some(_) if resume != Resume::Allow => {
                return Err(MlError::AlreadyExists(format!(
                    "tracked run {project}/{run_id}"
                )));
            }
            Some(mut existing) => {
                existing.status = TrainingStatus::Running;
                existing.resume_count += 1;
                existing.updated_at = now;
                existing.config = serde_json::to_value(config)?;
                tracing::info!(project, run_id = %run_id, resume_count = existing.resume_count, "Resuming tracked run");
                existing
            }
            None => RunRecord {
                project: project.to_string(),
                run_id: run_id.to_string(),
                status: TrainingStatus::Running,
                config: serde_json::to_value(config)?,
                created_at: now,
                updated_at: now,
                resume_count: 0,
                last_step: None,
            },
        };

        atomic_write_json(&run_file, &record)?;
        Ok(Self { run_dir, record })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Every row logged to this run so far, including earlier sessions.
    pub fn history(&self) -> Result<Vec<MetricRow>> {
        Ok(read_json_lines(&self.run_dir.join(METRICS_FILE))?)
    }
}

impl Tracker for LocalTracker {
    fn run_id(&self) -> &str {
        &self.record.run_id
    }

    fn log(&mut self, step: usize, logs: &Logs) -> Result<()> {
        let mut metrics = BTreeMap::new();
        for (name, value) in logs {
            // JSON has no NaN or infinity.
            if value.is_finite() {
                metrics.insert(name.clone(), *value);
            } else {
                tracing::debug!(metric = %name, %value, "Skipping non-finite metric");
            }
        }
        let row = MetricRow {
            step,
            timestamp: Utc::now(),
            metrics,
        };
        append_json_line(&self.run_dir.join(METRICS_FILE), &row)?;

        self.record.last_step = Some(step);
        self.record.updated_at = row.timestamp;
        atomic_write_json(&self.run_dir.join(RUN_FILE), &self.record)?;
        Ok(())
    }

    fn finish(&mut self, status: TrainingStatus) -> Result<()> {
        self.record.status = status;
        self.record.updated_at = Utc::now();
        atomic_write_json(&self.run_dir.join(RUN_FILE), &self.record)?;
        tracing::info!(run_id = %self.record.run_id, ?status, "Tracked run finished");
        Ok(())
    }

    fn last_step(&self) -> Option<usize> {
        self.record.last_step
    }
}

/// All runs recorded for `project`, oldest first.
pub fn list_runs(root: &Path, project: &str) -> Result<Vec<RunRecord>> {
    let project_dir = root.join(project);
    if !project_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    for entry in std::fs::read_dir(&project_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(record) = load_json::<RunRecord>(&entry.path().join(RUN_FILE))? {
            runs.push(record);
        }
    }
    runs.sort_by_key(|run| run.created_at);
    Ok(runs)
}
