use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::assemble::build_page;
use crate::checkpoint::CheckpointStore;
use crate::error::{StoreError, SyncError};
use crate::formats::{AnnotationItem, SourceItem};
use crate::model::{AnnotationPage, RunProgress, SyncCheckpoint};
use crate::preview::AnnotationPreview;
use crate::source::{AnnotationSourceClient, SourcePager, SyncWindow};
use crate::stats::{ProgressGate, RunStats, StatsCollector};
use crate::store::AnnotationStore;
use crate::writer::BulkWriter;

const CHANGED_FEED: &str = "changed items";
const DELETED_FEED: &str = "deleted ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    WindowComputed,
    Reading,
    Processing,
    Writing,
    CheckpointCommit,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WindowComputed => "window_computed",
            Self::Reading => "reading",
            Self::Processing => "processing",
            Self::Writing => "writing",
            Self::CheckpointCommit => "checkpoint_commit",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_name: String,
    pub page_size: usize,
    pub workers: usize,
    pub read_retries: usize,
    pub retry_backoff: Duration,
    pub progress_interval: u64,
    /// Skips the checkpoint commit and progress markers.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub job_name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub stats: RunStats,
    pub checkpoint_committed: bool,
}

pub struct JobOrchestrator {
    settings: JobSettings,
    store: Arc<dyn AnnotationStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Arc<watch::Sender<JobState>>,
}

/// Everything a worker needs for one run.
struct RunContext {
    run_id: String,
    settings: JobSettings,
    window: SyncWindow,
    writer: BulkWriter,
    stats: Arc<StatsCollector>,
    gate: ProgressGate,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Arc<watch::Sender<JobState>>,
    aborted: AtomicBool,
}

impl RunContext {
    fn enter(&self, state: JobState) {
        self.state.send_replace(state);
        tracing::trace!(run_id = %self.run_id, %state, "job state");
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn connectivity(&self, source: StoreError) -> SyncError {
        SyncError::Connectivity {
            from: self.window.from,
            to: self.window.to,
            source,
        }
    }
}

impl JobOrchestrator {
    pub fn new(
        settings: JobSettings,
        store: Arc<dyn AnnotationStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            settings,
            store,
            checkpoints,
            state: Arc::new(state),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    fn enter(&self, state: JobState) {
        self.state.send_replace(state);
        tracing::debug!(job = %self.settings.job_name, %state, "job state");
    }

    /// `[last successful start, to)`, starting at the epoch on a first run.
    pub async fn compute_window(&self, to: DateTime<Utc>) -> Result<SyncWindow, SyncError> {
        let latest = self
            .checkpoints
            .latest(&self.settings.job_name)
            .await
            .map_err(SyncError::Checkpoint)?;
        let from = latest
            .map(|c| c.last_successful_start_time)
            .unwrap_or(DateTime::UNIX_EPOCH);
        if from > to {
            tracing::warn!(%from, %to, "checkpoint is ahead of the clock; window is empty");
            return Ok(SyncWindow { from, to: from });
        }
        Ok(SyncWindow { from, to })
    }

    pub async fn run(&self, source: &AnnotationSourceClient) -> Result<RunReport, SyncError> {
        self.run_until(source, Utc::now()).await
    }

    pub async fn run_until(
        &self,
        source: &AnnotationSourceClient,
        to: DateTime<Utc>,
    ) -> Result<RunReport, SyncError> {
        let window = match self.compute_window(to).await {
            Ok(window) => window,
            Err(err) => {
                tracing::error!(job = %self.settings.job_name, error = %err, "failed to compute sync window");
                return Err(err);
            }
        };
        let page_size = self.settings.page_size;
        self.run_window(
            window,
            source.changed_items(window, page_size),
            source.deleted_ids(window, page_size),
        )
        .await
    }

    /// Syncs one window from the given feeds and commits the checkpoint if
    /// nothing fatal happened.
    pub async fn run_window<C, D>(
        &self,
        window: SyncWindow,
        changed: C,
        deleted: D,
    ) -> Result<RunReport, SyncError>
    where
        C: SourcePager + 'static,
        C::Item: Into<SourceItem>,
        D: SourcePager<Item = String> + 'static,
    {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.enter(JobState::WindowComputed);
        tracing::info!(
            run_id = %run_id,
            job = %self.settings.job_name,
            from = %window.from,
            to = %window.to,
            workers = self.settings.workers,
            page_size = self.settings.page_size,
            "sync started"
        );

        let stats = Arc::new(StatsCollector::start());
        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            settings: self.settings.clone(),
            window,
            writer: BulkWriter::new(Arc::clone(&self.store), Arc::clone(&stats)),
            stats: Arc::clone(&stats),
            gate: ProgressGate::new(self.settings.progress_interval),
            checkpoints: Arc::clone(&self.checkpoints),
            state: Arc::clone(&self.state),
            aborted: AtomicBool::new(false),
        });

        // Deletions go second so an item created and removed inside one
        // window ends up deprecated.
        let result = match drain(Arc::clone(&ctx), changed, CHANGED_FEED, process_items::<C::Item>).await {
            Ok(()) => drain(Arc::clone(&ctx), deleted, DELETED_FEED, process_deleted).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            self.enter(JobState::Failed);
            tracing::error!(
                run_id = %run_id,
                job = %self.settings.job_name,
                from = %window.from,
                to = %window.to,
                error = %err,
                "sync aborted; checkpoint left unchanged"
            );
            self.enter(JobState::Idle);
            return Err(err);
        }

        let checkpoint_committed = if self.settings.dry_run {
            false
        } else {
            self.enter(JobState::CheckpointCommit);
            let checkpoint = SyncCheckpoint {
                job_name: self.settings.job_name.clone(),
                last_successful_start_time: window.to,
            };
            match self.checkpoints.commit(&checkpoint).await {
                Ok(true) => true,
                Ok(false) => {
                    tracing::warn!(run_id = %run_id, to = %window.to, "checkpoint not advanced; a newer one exists");
                    false
                }
                Err(err) => {
                    self.enter(JobState::Failed);
                    tracing::error!(run_id = %run_id, error = %err, "failed to commit checkpoint");
                    self.enter(JobState::Idle);
                    return Err(SyncError::Checkpoint(err));
                }
            }
        };
        self.enter(JobState::Idle);

        let stats = stats.summary();
        tracing::info!(
            run_id = %run_id,
            job = %self.settings.job_name,
            new = stats.new,
            updated = stats.updated,
            unchanged = stats.unchanged,
            deprecated = stats.deprecated,
            skipped = stats.skipped,
            elapsed_ms = stats.elapsed_ms,
            checkpoint_committed,
            "sync finished"
        );

        Ok(RunReport {
            run_id,
            job_name: self.settings.job_name.clone(),
            from: window.from,
            to: window.to,
            stats,
            checkpoint_committed,
        })
    }
}

/// Fans one shared pager out to `workers` tasks. Fetches are serialized by
/// the pager's mutex; processing and writing run concurrently. Returns once
/// every worker is done, with the first fatal error if any.
async fn drain<P, F, Fut>(
    ctx: Arc<RunContext>,
    pager: P,
    feed: &'static str,
    handle: F,
) -> Result<(), SyncError>
where
    P: SourcePager + 'static,
    F: Fn(Arc<RunContext>, Vec<P::Item>) -> Fut + Copy + Send + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    let pager = Arc::new(Mutex::new(pager));
    let mut join_set = JoinSet::new();

    for worker in 0..ctx.settings.workers.max(1) {
        join_set.spawn(work_feed(
            Arc::clone(&ctx),
            Arc::clone(&pager),
            feed,
            handle,
            worker,
        ));
    }

    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        let outcome = joined.unwrap_or_else(|err| Err(SyncError::Worker(err.to_string())));
        if let Err(err) = outcome {
            ctx.abort();
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn work_feed<P, F, Fut>(
    ctx: Arc<RunContext>,
    pager: Arc<Mutex<P>>,
    feed: &'static str,
    handle: F,
    worker: usize,
) -> Result<(), SyncError>
where
    P: SourcePager,
    F: Fn(Arc<RunContext>, Vec<P::Item>) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    loop {
        if ctx.is_aborted() {
            return Ok(());
        }
        ctx.enter(JobState::Reading);
        let chunk = {
            let mut pager = pager.lock().await;
            if ctx.is_aborted() {
                return Ok(());
            }
            read_with_retry(&ctx, &mut *pager, feed).await?
        };
        let Some(chunk) = chunk else {
            tracing::debug!(run_id = %ctx.run_id, feed, worker, "feed drained");
            return Ok(());
        };
        tracing::debug!(run_id = %ctx.run_id, feed, worker, size = chunk.len(), "chunk read");
        handle(Arc::clone(&ctx), chunk).await?;
    }
}

async fn read_with_retry<P: SourcePager>(
    ctx: &RunContext,
    pager: &mut P,
    feed: &'static str,
) -> Result<Option<Vec<P::Item>>, SyncError> {
    let attempts = ctx.settings.read_retries.saturating_add(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match pager.next_page().await {
            Ok(page) => return Ok(page),
            Err(err) if attempt < attempts => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    feed,
                    attempt,
                    attempts,
                    error = %err,
                    "source read failed; retrying"
                );
                tokio::time::sleep(ctx.settings.retry_backoff * attempt as u32).await;
            }
            Err(err) => {
                return Err(SyncError::SourceExhausted {
                    feed,
                    attempts,
                    from: ctx.window.from,
                    to: ctx.window.to,
                    source: err,
                });
            }
        }
    }
}

enum ItemOutcome {
    Page(Box<AnnotationPage>),
    Ignored { motivation: String },
    Failed(String),
}

fn convert_item(item: &AnnotationItem, now: DateTime<Utc>) -> ItemOutcome {
    let preview = match AnnotationPreview::from_item(item) {
        Ok(Some(preview)) => preview,
        Ok(None) => {
            return ItemOutcome::Ignored {
                motivation: item.motivation.clone(),
            };
        }
        Err(err) => return ItemOutcome::Failed(format!("{err:#}")),
    };
    match build_page(&preview, now) {
        Ok(page) => ItemOutcome::Page(Box::new(page)),
        Err(err) => ItemOutcome::Failed(err.to_string()),
    }
}

async fn process_items<I>(ctx: Arc<RunContext>, items: Vec<I>) -> Result<(), SyncError>
where
    I: Into<SourceItem> + Send + 'static,
{
    ctx.enter(JobState::Processing);
    let item_count = items.len() as u64;
    let now = Utc::now();
    let converted = tokio::task::spawn_blocking(move || {
        items
            .into_iter()
            .map(|item| match Into::<SourceItem>::into(item) {
                SourceItem::Decoded(item) => {
                    let outcome = convert_item(&item, now);
                    (item.id, outcome)
                }
                SourceItem::Undecodable { id, error } => (
                    id.unwrap_or_else(|| "<no id>".to_owned()),
                    ItemOutcome::Failed(format!("undecodable source item: {error}")),
                ),
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|err| SyncError::Worker(format!("join conversion task: {err}")))?;

    let mut pages = Vec::with_capacity(converted.len());
    let mut skipped = 0u64;
    for (item_id, outcome) in converted {
        match outcome {
            ItemOutcome::Page(page) => pages.push(*page),
            ItemOutcome::Ignored { motivation } => {
                skipped += 1;
                tracing::debug!(run_id = %ctx.run_id, item_id = %item_id, %motivation, "skipping item with unsupported motivation");
            }
            ItemOutcome::Failed(error) => {
                skipped += 1;
                tracing::warn!(run_id = %ctx.run_id, item_id = %item_id, %error, "skipping item that failed conversion");
            }
        }
    }
    ctx.stats.record_skipped(skipped);

    ctx.enter(JobState::Writing);
    let batch_size = pages.len() as u64;
    match ctx.writer.upsert(pages).await {
        Ok(outcome) => {
            tracing::debug!(
                run_id = %ctx.run_id,
                new = outcome.new,
                updated = outcome.updated,
                unchanged = outcome.unchanged,
                "batch written"
            );
        }
        Err(err) if err.is_connectivity() => return Err(ctx.connectivity(err)),
        Err(err) => {
            ctx.stats.record_skipped(batch_size);
            log_dropped_batch(&ctx, &err);
        }
    }

    report_progress(&ctx, item_count).await;
    Ok(())
}

async fn process_deleted(ctx: Arc<RunContext>, ids: Vec<String>) -> Result<(), SyncError> {
    ctx.enter(JobState::Writing);
    let id_count = ids.len() as u64;
    match ctx.writer.deprecate(&ids).await {
        Ok(count) => {
            tracing::debug!(run_id = %ctx.run_id, ids = id_count, deprecated = count, "deprecation batch written");
        }
        Err(err) if err.is_connectivity() => return Err(ctx.connectivity(err)),
        Err(err) => {
            ctx.stats.record_skipped(id_count);
            log_dropped_batch(&ctx, &err);
        }
    }

    report_progress(&ctx, id_count).await;
    Ok(())
}

fn log_dropped_batch(ctx: &RunContext, err: &StoreError) {
    let batch_ids = match err {
        StoreError::Write { ids, .. } => ids.join(", "),
        _ => String::new(),
    };
    tracing::warn!(
        run_id = %ctx.run_id,
        error = %err,
        batch_ids = %batch_ids,
        "dropping batch after write failure"
    );
}

async fn report_progress(ctx: &Arc<RunContext>, processed: u64) {
    ctx.gate
        .advance(processed, |total| async move {
            tracing::info!(run_id = %ctx.run_id, processed = total, "sync progress");
            if ctx.settings.dry_run {
                return;
            }
            let progress = RunProgress {
                run_id: ctx.run_id.clone(),
                job_name: ctx.settings.job_name.clone(),
                from: ctx.window.from,
                to: ctx.window.to,
                processed: total,
                updated_at: Utc::now(),
            };
            if let Err(err) = ctx.checkpoints.record_progress(&progress).await {
                tracing::warn!(run_id = %ctx.run_id, error = %err, "failed to record run progress");
            }
        })
        .await;
}
