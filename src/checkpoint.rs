use std::io;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use crate::cli::CheckpointShowArgs;
use crate::error::StoreError;
use crate::model::{RunProgress, SyncCheckpoint};
use crate::store::{read_json, write_json_atomic};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest checkpoint for the job, by `last_successful_start_time`.
    async fn latest(&self, job_name: &str) -> Result<Option<SyncCheckpoint>, StoreError>;

    /// Records a checkpoint. Returns `false` (and stores nothing) when it would
    /// move the job backwards in time.
    async fn commit(&self, checkpoint: &SyncCheckpoint) -> Result<bool, StoreError>;

    async fn record_progress(&self, progress: &RunProgress) -> Result<(), StoreError>;

    async fn progress(&self, job_name: &str) -> Result<Option<RunProgress>, StoreError>;
}

fn is_forward(latest: Option<&SyncCheckpoint>, candidate: &SyncCheckpoint) -> bool {
    latest.is_none_or(|latest| candidate.last_successful_start_time > latest.last_successful_start_time)
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<Vec<SyncCheckpoint>>,
    progress: Mutex<Vec<RunProgress>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn latest(&self, job_name: &str) -> Result<Option<SyncCheckpoint>, StoreError> {
        Ok(self
            .checkpoints
            .lock()
            .await
            .iter()
            .filter(|c| c.job_name == job_name)
            .max_by_key(|c| c.last_successful_start_time)
            .cloned())
    }

    async fn commit(&self, checkpoint: &SyncCheckpoint) -> Result<bool, StoreError> {
        let latest = self.latest(&checkpoint.job_name).await?;
        if !is_forward(latest.as_ref(), checkpoint) {
            return Ok(false);
        }
        self.checkpoints.lock().await.push(checkpoint.clone());
        Ok(true)
    }

    async fn record_progress(&self, progress: &RunProgress) -> Result<(), StoreError> {
        self.progress.lock().await.push(progress.clone());
        Ok(())
    }

    async fn progress(&self, job_name: &str) -> Result<Option<RunProgress>, StoreError> {
        Ok(self
            .progress
            .lock()
            .await
            .iter()
            .rev()
            .find(|p| p.job_name == job_name)
            .cloned())
    }
}

/// Append-only `<base>/checkpoints/<job>.jsonl` log plus a
/// `<job>.progress.json` marker for the run in flight.
#[derive(Debug)]
pub struct LocalFsCheckpointStore {
    base_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl LocalFsCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    fn log_path(&self, job_name: &str) -> Result<PathBuf, StoreError> {
        Ok(self.checkpoints_dir().join(format!("{}.jsonl", job_file_stem(job_name)?)))
    }

    fn progress_path(&self, job_name: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .checkpoints_dir()
            .join(format!("{}.progress.json", job_file_stem(job_name)?)))
    }
}

fn job_file_stem(job_name: &str) -> Result<&str, StoreError> {
    let valid = !job_name.is_empty()
        && job_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !job_name.starts_with('.');
    if !valid {
        return Err(StoreError::Corrupt(format!("invalid job name: {job_name:?}")));
    }
    Ok(job_name)
}

fn io_to_store(err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::InvalidData => StoreError::Corrupt(err.to_string()),
        _ => StoreError::Connectivity(err.to_string()),
    }
}

#[async_trait]
impl CheckpointStore for LocalFsCheckpointStore {
    async fn latest(&self, job_name: &str) -> Result<Option<SyncCheckpoint>, StoreError> {
        let path = self.log_path(job_name)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_to_store(err)),
        };

        let mut latest: Option<SyncCheckpoint> = None;
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let checkpoint: SyncCheckpoint = serde_json::from_str(line).map_err(|err| {
                StoreError::Corrupt(format!("{} line {}: {err}", path.display(), idx + 1))
            })?;
            if is_forward(latest.as_ref(), &checkpoint) {
                latest = Some(checkpoint);
            }
        }
        Ok(latest)
    }

    async fn commit(&self, checkpoint: &SyncCheckpoint) -> Result<bool, StoreError> {
        let _guard = self.append_lock.lock().await;
        let latest = self.latest(&checkpoint.job_name).await?;
        if !is_forward(latest.as_ref(), checkpoint) {
            return Ok(false);
        }

        let path = self.log_path(&checkpoint.job_name)?;
        fs::create_dir_all(self.checkpoints_dir())
            .await
            .map_err(io_to_store)?;
        let mut line = serde_json::to_vec(checkpoint)
            .map_err(|err| StoreError::Corrupt(format!("serialize checkpoint: {err}")))?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_to_store)?;
        file.write_all(&line).await.map_err(io_to_store)?;
        file.sync_data().await.map_err(io_to_store)?;
        Ok(true)
    }

    async fn record_progress(&self, progress: &RunProgress) -> Result<(), StoreError> {
        let path = self.progress_path(&progress.job_name)?;
        write_json_atomic(&path, progress).await.map_err(io_to_store)
    }

    async fn progress(&self, job_name: &str) -> Result<Option<RunProgress>, StoreError> {
        let path = self.progress_path(job_name)?;
        read_json(&path).await.map_err(io_to_store)
    }
}

/// Prints the latest checkpoint and the last progress marker of a job.
pub async fn show(args: CheckpointShowArgs) -> anyhow::Result<Option<SyncCheckpoint>> {
    let store = LocalFsCheckpointStore::new(&args.store_dir);
    let latest = store
        .latest(&args.job)
        .await
        .with_context(|| format!("read checkpoint for job {}", args.job))?;
    let progress = store
        .progress(&args.job)
        .await
        .with_context(|| format!("read progress for job {}", args.job))?;

    let json = serde_json::json!({
        "job_name": args.job,
        "checkpoint": latest,
        "progress": progress,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&json).context("serialize checkpoint")?
    );
    Ok(latest)
}
