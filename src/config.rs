use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cli::SyncArgs;
use crate::job::JobSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "SyncConfig::default_job_name")]
    pub job_name: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "SyncConfig::default_workers")]
    pub workers: usize,
    #[serde(default = "SyncConfig::default_progress_interval")]
    pub progress_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "SourceConfig::default_page_size")]
    pub page_size: usize,
    #[serde(default = "SourceConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "SourceConfig::default_read_retries")]
    pub read_retries: usize,
    #[serde(default = "SourceConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn default_job_name() -> String {
        "annotation-sync".to_owned()
    }

    pub fn default_workers() -> usize {
        4
    }

    pub fn default_progress_interval() -> u64 {
        1000
    }
}

impl SourceConfig {
    pub fn default_page_size() -> usize {
        100
    }

    pub fn default_timeout_secs() -> u64 {
        30
    }

    pub fn default_read_retries() -> usize {
        3
    }

    pub fn default_retry_backoff_ms() -> u64 {
        500
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            job_name: Self::default_job_name(),
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            workers: Self::default_workers(),
            progress_interval: Self::default_progress_interval(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            page_size: Self::default_page_size(),
            timeout_secs: Self::default_timeout_secs(),
            read_retries: Self::default_read_retries(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse config yaml: {}", path.display()))
    }

    /// File (if any) first, then every flag that was given on top.
    pub fn resolve(args: &SyncArgs) -> anyhow::Result<Self> {
        let mut config = match args.config.as_deref() {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate(args.dry_run)?;
        Ok(config)
    }

    fn apply(&mut self, args: &SyncArgs) {
        if let Some(job_name) = &args.job {
            self.job_name = job_name.clone();
        }
        if let Some(base_url) = &args.source_url {
            self.source.base_url = Some(base_url.clone());
        }
        if let Some(api_key) = &args.api_key {
            self.source.api_key = Some(api_key.clone());
        }
        if let Some(page_size) = args.page_size {
            self.source.page_size = page_size;
        }
        if let Some(timeout_secs) = args.timeout_secs {
            self.source.timeout_secs = timeout_secs;
        }
        if let Some(read_retries) = args.read_retries {
            self.source.read_retries = read_retries;
        }
        if let Some(dir) = &args.store_dir {
            self.store.dir = Some(dir.clone());
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(interval) = args.progress_interval {
            self.progress_interval = interval;
        }
    }

    pub fn validate(&self, dry_run: bool) -> anyhow::Result<()> {
        if self.job_name.trim().is_empty() {
            anyhow::bail!("job_name must not be empty");
        }
        if self.source.page_size == 0 {
            anyhow::bail!("source.page_size must be > 0");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be > 0");
        }
        if self.progress_interval == 0 {
            anyhow::bail!("progress_interval must be > 0");
        }
        self.base_url()?;
        if self.store.dir.is_none() && !dry_run {
            anyhow::bail!("store.dir is required (or pass --dry-run)");
        }
        Ok(())
    }

    pub fn base_url(&self) -> anyhow::Result<Url> {
        let raw = self
            .source
            .base_url
            .as_deref()
            .context("source.base_url is required")?;
        let url = Url::parse(raw).with_context(|| format!("parse source.base_url: {raw}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("source.base_url must be http/https: {raw}");
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn job_settings(&self, dry_run: bool) -> JobSettings {
        JobSettings {
            job_name: self.job_name.clone(),
            page_size: self.source.page_size,
            workers: self.workers,
            read_retries: self.source.read_retries,
            retry_backoff: Duration::from_millis(self.source.retry_backoff_ms),
            progress_interval: self.progress_interval,
            dry_run,
        }
    }
}
