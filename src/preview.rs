use url::Url;

use crate::formats::{AnnotationItem, MOTIVATION_SUBTITLING, MOTIVATION_TRANSCRIBING};

/// Normalized input to conversion, built either from a source item or from a
/// direct submission. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPreview {
    record_id: String,
    record_uri: Option<String>,
    media: String,
    language: String,
    rights: Option<String>,
    original_lang: bool,
    format: String,
    payload: String,
    source: Option<String>,
}

impl AnnotationPreview {
    pub fn builder() -> AnnotationPreviewBuilder {
        AnnotationPreviewBuilder::default()
    }

    /// Returns `Ok(None)` for motivations this pipeline does not ingest.
    pub fn from_item(item: &AnnotationItem) -> anyhow::Result<Option<Self>> {
        let original_lang = match item.motivation.as_str() {
            MOTIVATION_SUBTITLING => false,
            MOTIVATION_TRANSCRIBING => true,
            _ => return Ok(None),
        };

        let record_id = record_id_from_scope(&item.target.scope)?;
        let mut builder = Self::builder()
            .record_id(record_id)
            .record_uri(&item.target.scope)
            .media(&item.target.source)
            .language(&item.body.language)
            .original_lang(original_lang)
            .format(&item.body.format)
            .payload(&item.body.value)
            .source(&item.id);
        if let Some(rights) = item.body.rights.as_deref() {
            builder = builder.rights(rights);
        }
        builder.build().map(Some)
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Record URI as the source gave it, if any.
    pub fn record_uri(&self) -> Option<&str> {
        self.record_uri.as_deref()
    }

    pub fn media(&self) -> &str {
        &self.media
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn rights(&self) -> Option<&str> {
        self.rights.as_deref()
    }

    pub fn original_lang(&self) -> bool {
        self.original_lang
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

#[derive(Debug, Default, Clone)]
pub struct AnnotationPreviewBuilder {
    record_id: Option<String>,
    record_uri: Option<String>,
    media: Option<String>,
    language: Option<String>,
    rights: Option<String>,
    original_lang: bool,
    format: Option<String>,
    payload: Option<String>,
    source: Option<String>,
}

impl AnnotationPreviewBuilder {
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn record_uri(mut self, record_uri: impl Into<String>) -> Self {
        self.record_uri = Some(record_uri.into());
        self
    }

    pub fn media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn rights(mut self, rights: impl Into<String>) -> Self {
        self.rights = Some(rights.into());
        self
    }

    pub fn original_lang(mut self, original_lang: bool) -> Self {
        self.original_lang = original_lang;
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn build(self) -> anyhow::Result<AnnotationPreview> {
        let record_id = required("record id", self.record_id)?;
        parse_record_id(&record_id)?;
        let language = required("language", self.language)?.trim().to_ascii_lowercase();
        if language.is_empty() {
            anyhow::bail!("language must not be blank");
        }

        Ok(AnnotationPreview {
            record_id,
            record_uri: self.record_uri.filter(|uri| !uri.trim().is_empty()),
            media: required("media", self.media)?,
            language,
            rights: self.rights,
            original_lang: self.original_lang,
            format: required("format", self.format)?,
            payload: self.payload.unwrap_or_default(),
            source: self.source,
        })
    }
}

fn required(field: &str, value: Option<String>) -> anyhow::Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => anyhow::bail!("annotation preview is missing {field}"),
    }
}

/// Splits `/{dataset}/{local}` into its two parts.
pub fn parse_record_id(record_id: &str) -> anyhow::Result<(&str, &str)> {
    let mut parts = record_id.trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(dataset), Some(local), None) if !dataset.is_empty() && !local.is_empty() => {
            Ok((dataset, local))
        }
        _ => anyhow::bail!("record id must look like /dataset/local: {record_id:?}"),
    }
}

/// Takes the last two path segments of a record URI as the record id.
pub fn record_id_from_scope(scope: &str) -> anyhow::Result<String> {
    let path = match Url::parse(scope) {
        Ok(url) => url.path().to_owned(),
        Err(_) => scope.to_owned(),
    };
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    match segments.as_slice() {
        [.., dataset, local] => Ok(format!("/{dataset}/{local}")),
        _ => anyhow::bail!("target scope has no record id: {scope:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{AnnotationBody, AnnotationTarget};

    fn item(motivation: &str) -> AnnotationItem {
        AnnotationItem {
            id: "https://annotations.example/annotation/42".to_owned(),
            motivation: motivation.to_owned(),
            target: AnnotationTarget {
                scope: "http://data.europeana.eu/item/9200/abc".to_owned(),
                source: "https://media.example/video.mp4".to_owned(),
            },
            body: AnnotationBody {
                value: "WEBVTT\n".to_owned(),
                format: "text/vtt".to_owned(),
                language: "EN".to_owned(),
                rights: Some("http://creativecommons.org/licenses/by/4.0/".to_owned()),
            },
            creator: None,
            created: None,
            generated: None,
        }
    }

    #[test]
    fn from_item_normalizes_fields() -> anyhow::Result<()> {
        let preview = AnnotationPreview::from_item(&item("subtitling"))?
            .ok_or_else(|| anyhow::anyhow!("expected preview"))?;
        assert_eq!(preview.record_id(), "/9200/abc");
        assert_eq!(preview.record_uri(), Some("http://data.europeana.eu/item/9200/abc"));
        assert_eq!(preview.language(), "en");
        assert_eq!(preview.source(), Some("https://annotations.example/annotation/42"));
        assert!(!preview.original_lang());
        Ok(())
    }

    #[test]
    fn transcriptions_are_original_language() -> anyhow::Result<()> {
        let preview = AnnotationPreview::from_item(&item("transcribing"))?
            .ok_or_else(|| anyhow::anyhow!("expected preview"))?;
        assert!(preview.original_lang());
        Ok(())
    }

    #[test]
    fn other_motivations_are_ignored() -> anyhow::Result<()> {
        assert!(AnnotationPreview::from_item(&item("tagging"))?.is_none());
        Ok(())
    }

    #[test]
    fn builder_rejects_missing_media() {
        let err = AnnotationPreview::builder()
            .record_id("/1/2")
            .language("en")
            .format("text/plain")
            .build()
            .unwrap_err()
            .to_string();
        assert!(err.contains("media"));
    }

    #[test]
    fn record_id_requires_two_segments() {
        assert!(parse_record_id("/9200/abc").is_ok());
        assert!(parse_record_id("/9200").is_err());
        assert!(parse_record_id("/a/b/c").is_err());
    }
}
