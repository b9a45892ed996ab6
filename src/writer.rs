use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::model::AnnotationPage;
use crate::stats::StatsCollector;
use crate::store::{AnnotationStore, UpsertOutcome};

/// Batch persistence in front of an [`AnnotationStore`], feeding the run's
/// counters on success.
#[derive(Clone)]
pub struct BulkWriter {
    store: Arc<dyn AnnotationStore>,
    stats: Arc<StatsCollector>,
}

impl BulkWriter {
    pub fn new(store: Arc<dyn AnnotationStore>, stats: Arc<StatsCollector>) -> Self {
        Self { store, stats }
    }

    pub async fn upsert(&self, mut pages: Vec<AnnotationPage>) -> Result<UpsertOutcome, StoreError> {
        if pages.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let now = Utc::now();
        for page in &mut pages {
            page.last_modified = now;
        }
        let outcome = self.store.upsert_pages(&pages).await?;
        self.stats.record_upsert(outcome);
        Ok(outcome)
    }

    pub async fn deprecate(&self, source_ids: &[String]) -> Result<u64, StoreError> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let count = self
            .store
            .deprecate_by_sources(source_ids, Utc::now())
            .await?;
        self.stats.record_deprecated(count);
        Ok(count)
    }
}
