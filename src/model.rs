use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Character range `[from, to)` inside a resource's text.
///
/// `from == 0 && to == 0` anchors the whole resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextBoundary {
    pub from: u32,
    pub to: u32,
}

impl TextBoundary {
    pub const WHOLE_RESOURCE: Self = Self { from: 0, to: 0 };

    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn is_whole_resource(&self) -> bool {
        self.from == 0 && self.to == 0
    }
}

/// Millisecond range `[start, end)` inside a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBoundary {
    pub start: u64,
    pub end: u64,
}

impl TimeBoundary {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Only non-empty ranges are ever stored.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    Page,
    Block,
    Line,
    Word,
    Media,
    Caption,
}

impl AnnotationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Block => "block",
            Self::Line => "line",
            Self::Word => "word",
            Self::Media => "media",
            Self::Caption => "caption",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Id of the page's [`Resource`] the text boundary points into.
    pub resource_id: String,
    pub text: TextBoundary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeBoundary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub value: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
    pub record_uri: String,
}

/// Natural primary key of a stored page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageKey {
    pub dataset_id: String,
    pub local_id: String,
    pub page_id: String,
    pub language: String,
}

impl PageKey {
    /// Every part has to work as a single path component.
    pub fn validate(&self) -> Result<(), String> {
        for segment in [&self.dataset_id, &self.local_id, &self.page_id, &self.language] {
            key_segment(segment)?;
        }
        Ok(())
    }
}

pub fn key_segment(value: &str) -> Result<&str, String> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(format!("invalid key segment: {value:?}"));
    }
    Ok(value)
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/{}/{}/{}@{}",
            self.dataset_id, self.local_id, self.page_id, self.language
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPage {
    pub dataset_id: String,
    pub local_id: String,
    pub page_id: String,
    pub target_id: String,
    pub language: String,
    pub original_lang: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub annotations: Vec<Annotation>,
    pub resource: Resource,
    pub last_modified: DateTime<Utc>,
    pub deprecated: bool,
}

impl AnnotationPage {
    pub fn key(&self) -> PageKey {
        PageKey {
            dataset_id: self.dataset_id.clone(),
            local_id: self.local_id.clone(),
            page_id: self.page_id.clone(),
            language: self.language.clone(),
        }
    }

    /// Compares everything a sync could change, ignoring `last_modified`.
    pub fn same_content(&self, other: &Self) -> bool {
        self.target_id == other.target_id
            && self.original_lang == other.original_lang
            && self.source == other.source
            && self.annotations == other.annotations
            && self.resource == other.resource
            && self.deprecated == other.deprecated
            && self.key() == other.key()
    }

    /// Slice of the resource text a boundary points at.
    pub fn text_of(&self, boundary: &TextBoundary) -> Option<&str> {
        if boundary.is_whole_resource() {
            return Some(&self.resource.value);
        }
        slice_chars(&self.resource.value, boundary.from, boundary.to)
    }
}

pub(crate) fn slice_chars(value: &str, from: u32, to: u32) -> Option<&str> {
    if from > to {
        return None;
    }
    let mut indices = value
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(value.len()));
    let start = indices.nth(from as usize)?;
    let end = if to == from {
        start
    } else {
        indices.nth((to - from - 1) as usize)?
    };
    value.get(start..end)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub job_name: String,
    pub last_successful_start_time: DateTime<Utc>,
}

/// Informational marker written while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub job_name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub processed: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_boundary_requires_non_empty_range() {
        assert!(TimeBoundary::new(0, 1).is_valid());
        assert!(!TimeBoundary::new(5, 5).is_valid());
        assert!(!TimeBoundary::new(6, 5).is_valid());
    }

    #[test]
    fn slice_chars_counts_scalar_values() {
        let text = "héllo wörld";
        assert_eq!(slice_chars(text, 0, 5), Some("héllo"));
        assert_eq!(slice_chars(text, 6, 11), Some("wörld"));
        assert_eq!(slice_chars(text, 3, 3), Some(""));
        assert_eq!(slice_chars(text, 6, 12), None);
    }

    #[test]
    fn page_key_parts_must_be_single_path_components() {
        let key = |language: &str, page_id: &str| PageKey {
            dataset_id: "2048".to_owned(),
            local_id: "rec1".to_owned(),
            page_id: page_id.to_owned(),
            language: language.to_owned(),
        };
        assert!(key("en", "media.example-clip.mp4").validate().is_ok());
        assert!(key("en/gb", "media.example-clip.mp4").validate().is_err());
        assert!(key("en", "").validate().is_err());
        assert!(key("..", "media.example-clip.mp4").validate().is_err());
    }
}
