use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore, LocalFsCheckpointStore};
use crate::cli::SyncArgs;
use crate::config::SyncConfig;
use crate::job::{JobOrchestrator, RunReport};
use crate::source::AnnotationSourceClient;
use crate::store::{AnnotationStore, InMemoryAnnotationStore, LocalFsAnnotationStore};

pub async fn run(args: SyncArgs) -> anyhow::Result<RunReport> {
    let config = SyncConfig::resolve(&args).context("resolve sync config")?;
    let source = AnnotationSourceClient::new(
        config.base_url()?,
        config.source.api_key.clone(),
        config.timeout(),
    )?;

    let checkpoints: Arc<dyn CheckpointStore> = match config.store.dir.as_deref() {
        Some(dir) => Arc::new(LocalFsCheckpointStore::new(dir)),
        None => Arc::new(InMemoryCheckpointStore::new()),
    };
    let store: Arc<dyn AnnotationStore> = if args.dry_run {
        tracing::info!("dry run: writing to memory only");
        Arc::new(InMemoryAnnotationStore::new())
    } else {
        let dir = config
            .store
            .dir
            .as_deref()
            .context("store dir is required")?;
        let store = LocalFsAnnotationStore::open(dir)
            .await
            .with_context(|| format!("open annotation store: {}", dir.display()))?;
        Arc::new(store)
    };

    let job = JobOrchestrator::new(config.job_settings(args.dry_run), store, checkpoints);
    let report = job.run(&source).await?;

    let json = serde_json::to_string_pretty(&report).context("serialize run report")?;
    println!("{json}");
    if let Some(path) = args.stats_out.as_deref() {
        write_report(path, &json).await?;
    }
    Ok(report)
}

async fn write_report(path: &Path, json: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create stats dir: {}", parent.display()))?;
    }
    tokio::fs::write(path, format!("{json}\n"))
        .await
        .with_context(|| format!("write stats: {}", path.display()))
}
