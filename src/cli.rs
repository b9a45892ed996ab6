use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync one window of changed/deleted annotations into the store.
    Sync(SyncArgs),
    /// Convert a single local subtitle file into an annotation page.
    Convert(ConvertArgs),
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// YAML config file; flags override its values.
    #[arg(long, env = "ANNOSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Job name the checkpoint is kept under.
    #[arg(long, env = "ANNOSYNC_JOB")]
    pub job: Option<String>,

    /// Base URL of the annotation source (must be http/https).
    #[arg(long, env = "ANNOSYNC_SOURCE_URL")]
    pub source_url: Option<String>,

    /// API key, sent as the `apikey` query parameter.
    #[arg(long, env = "ANNOSYNC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Items requested per source page.
    #[arg(long, env = "ANNOSYNC_PAGE_SIZE")]
    pub page_size: Option<usize>,

    /// HTTP timeout for source requests, in seconds.
    #[arg(long, env = "ANNOSYNC_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Retries per source page before the run is aborted.
    #[arg(long, env = "ANNOSYNC_READ_RETRIES")]
    pub read_retries: Option<usize>,

    /// Directory holding annotation pages and checkpoints.
    #[arg(long, env = "ANNOSYNC_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Concurrent processing workers.
    #[arg(long, env = "ANNOSYNC_WORKERS")]
    pub workers: Option<usize>,

    /// Processed items between progress markers.
    #[arg(long, env = "ANNOSYNC_PROGRESS_INTERVAL")]
    pub progress_interval: Option<u64>,

    /// Write into memory only and leave the checkpoint untouched.
    #[arg(long)]
    pub dry_run: bool,

    /// Also write the run summary JSON to this file.
    #[arg(long)]
    pub stats_out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Record id, `/{datasetId}/{localId}`.
    #[arg(long)]
    pub record_id: String,

    /// Media URI the subtitles belong to.
    #[arg(long)]
    pub media: String,

    /// Payload language.
    #[arg(long)]
    pub language: String,

    /// Payload mime type (e.g. `text/vtt`).
    #[arg(long)]
    pub format: String,

    /// Local payload file.
    #[arg(long)]
    pub input: PathBuf,

    /// Rights statement URI.
    #[arg(long)]
    pub rights: Option<String>,

    /// Mark the payload as a transcription in the original language.
    #[arg(long)]
    pub original_lang: bool,

    /// Also upsert the page into this store directory.
    #[arg(long, env = "ANNOSYNC_STORE_DIR")]
    pub store_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum CheckpointCommand {
    /// Print the latest checkpoint of a job.
    Show(CheckpointShowArgs),
}

#[derive(Debug, Args)]
pub struct CheckpointShowArgs {
    #[arg(long, env = "ANNOSYNC_STORE_DIR")]
    pub store_dir: PathBuf,

    #[arg(long, env = "ANNOSYNC_JOB", default_value = "annotation-sync")]
    pub job: String,
}
