use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MOTIVATION_SUBTITLING: &str = "subtitling";
pub const MOTIVATION_TRANSCRIBING: &str = "transcribing";

/// An annotation record as served by the external annotation source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationItem {
    pub id: String,
    pub motivation: String,
    pub target: AnnotationTarget,
    pub body: AnnotationBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<AnnotationCreator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<DateTime<Utc>>,
}

/// One entry of the changed feed. An entry that does not decode stays in the
/// page so it can be logged and counted on its own.
#[derive(Debug, Clone)]
pub enum SourceItem {
    Decoded(AnnotationItem),
    Undecodable { id: Option<String>, error: String },
}

impl SourceItem {
    pub fn decode(value: Value) -> Self {
        let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
        match serde_json::from_value::<AnnotationItem>(value) {
            Ok(item) => Self::Decoded(item),
            Err(err) => Self::Undecodable {
                id,
                error: err.to_string(),
            },
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Decoded(item) => Some(&item.id),
            Self::Undecodable { id, .. } => id.as_deref(),
        }
    }
}

impl From<AnnotationItem> for SourceItem {
    fn from(item: AnnotationItem) -> Self {
        Self::Decoded(item)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationTarget {
    /// Record URI, e.g. `http://data.europeana.eu/item/9200/abc`.
    pub scope: String,
    /// Media URI the annotation is about.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationBody {
    pub value: String,
    pub format: String,
    pub language: String,
    #[serde(default, alias = "edmRights", skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationCreator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Envelope shared by both source feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePage<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
