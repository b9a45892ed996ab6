//! Content-addressed identifiers.
//!
//! Every id is a SHA-256 over a field-separated concatenation of the entity's
//! semantic inputs. Unchanged inputs give byte-identical ids.

use sha2::Digest as _;

use crate::model::{AnnotationType, TextBoundary, TimeBoundary};

const FIELD_SEPARATOR: u8 = 0x1f;

fn digest_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = sha2::Sha256::new();
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn resource_id(record_id: &str, language: &str, media_uri: &str) -> String {
    digest_fields(["resource", record_id, language, media_uri])
}

/// Semantic fields of an annotation that take part in its id.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationFields<'a> {
    pub kind: AnnotationType,
    pub text: &'a TextBoundary,
    pub time: Option<&'a TimeBoundary>,
    pub confidence: Option<f32>,
}

pub fn annotation_id(fields: AnnotationFields<'_>, target_id: &str, language: &str) -> String {
    let text = format!("{}-{}", fields.text.from, fields.text.to);
    let time = fields
        .time
        .map(|time| format!("{}-{}", time.start, time.end))
        .unwrap_or_default();
    let confidence = fields
        .confidence
        .map(|c| format!("{c:.4}"))
        .unwrap_or_default();
    digest_fields([
        "annotation",
        fields.kind.as_str(),
        &text,
        &time,
        &confidence,
        target_id,
        language,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_is_stable() {
        let a = resource_id("/9200/abc", "en", "https://media.example/v.mp4");
        let b = resource_id("/9200/abc", "en", "https://media.example/v.mp4");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn resource_id_differs_by_language() {
        let en = resource_id("/9200/abc", "en", "https://media.example/v.mp4");
        let de = resource_id("/9200/abc", "de", "https://media.example/v.mp4");
        assert_ne!(en, de);
    }

    #[test]
    fn field_boundaries_are_not_ambiguous() {
        assert_ne!(resource_id("/a/b", "en", "x"), resource_id("/a/b", "e", "nx"));
    }

    #[test]
    fn annotation_id_covers_time_and_language() {
        let text = TextBoundary::new(0, 5);
        let time = TimeBoundary::new(0, 1000);
        let fields = AnnotationFields {
            kind: AnnotationType::Caption,
            text: &text,
            time: Some(&time),
            confidence: None,
        };
        let base = annotation_id(fields, "https://media.example/v.mp4", "en");
        assert_eq!(base, annotation_id(fields, "https://media.example/v.mp4", "en"));
        assert_ne!(base, annotation_id(fields, "https://media.example/v.mp4", "fr"));

        let untimed = AnnotationFields { time: None, ..fields };
        assert_ne!(base, annotation_id(untimed, "https://media.example/v.mp4", "en"));
    }
}
