use chrono::{DateTime, Utc};

/// Failure while turning a subtitle/transcription payload into cues.
///
/// Both variants are item-level: the orchestrator logs the item and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("payload is not valid {mime}: {reason}")]
    InvalidFormat { mime: String, reason: String },

    #[error("failed to parse payload: {0}")]
    Parsing(String),
}

impl ConvertError {
    pub fn invalid_format(mime: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            mime: mime.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to annotation source failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("annotation source returned {status} for {url}: {body}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
        body: String,
    },

    #[error("failed to decode annotation source response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached at all. Job-fatal.
    #[error("annotation store is unreachable: {0}")]
    Connectivity(String),

    /// The store was reachable but rejected the batch.
    #[error("failed to write batch ({} ids): {message}", ids.len())]
    Write { ids: Vec<String>, message: String },

    #[error("stored document is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// A run-level failure. Any of these leaves the checkpoint untouched.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("lost connection to store while syncing window [{from}, {to}): {source}")]
    Connectivity {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        #[source]
        source: StoreError,
    },

    #[error("{feed} feed failed after {attempts} attempt(s) in window [{from}, {to}): {source}")]
    SourceExhausted {
        feed: &'static str,
        attempts: usize,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        #[source]
        source: SourceError,
    },

    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[source] StoreError),

    #[error("sync worker failed: {0}")]
    Worker(String),
}
