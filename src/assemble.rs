use anyhow::Context as _;
use chrono::{DateTime, Utc};
use url::Url;

use crate::cli::ConvertArgs;
use crate::convert::{self, ConvertedSubtitles};
use crate::error::ConvertError;
use crate::ids::{self, AnnotationFields};
use crate::model::{Annotation, AnnotationPage, Resource};
use crate::preview::{AnnotationPreview, parse_record_id};
use crate::store::{AnnotationStore as _, LocalFsAnnotationStore};

const RECORD_URI_BASE: &str = "http://data.europeana.eu/item";

/// Readable, stable page id for a media URI.
///
/// Drops the scheme, lowercases the host and squeezes anything outside
/// `[A-Za-z0-9._-]` into single dashes.
pub fn page_id_from_media(media_uri: &str) -> String {
    let normalized = match Url::parse(media_uri) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
            let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
            format!("{host}{port}{}{query}", url.path())
        }
        Err(_) => media_uri.to_owned(),
    };

    let mut out = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}

pub fn record_uri(record_id: &str) -> String {
    format!("{RECORD_URI_BASE}{record_id}")
}

pub fn assemble(
    preview: &AnnotationPreview,
    converted: ConvertedSubtitles,
    now: DateTime<Utc>,
) -> anyhow::Result<AnnotationPage> {
    let (dataset_id, local_id) = parse_record_id(preview.record_id())?;
    let target_id = preview.media().to_owned();
    let language = preview.language().to_owned();

    let resource = Resource {
        id: ids::resource_id(preview.record_id(), &language, &target_id),
        value: converted.text,
        language: language.clone(),
        rights: preview.rights().map(str::to_owned),
        record_uri: preview
            .record_uri()
            .map_or_else(|| record_uri(preview.record_id()), str::to_owned),
    };

    let annotations = converted
        .annotations
        .into_iter()
        .map(|converted| {
            let fields = AnnotationFields {
                kind: converted.kind,
                text: &converted.text,
                time: converted.time.as_ref(),
                confidence: None,
            };
            Annotation {
                id: ids::annotation_id(fields, &target_id, &language),
                kind: converted.kind,
                language: Some(language.clone()),
                confidence: None,
                resource_id: resource.id.clone(),
                text: converted.text,
                time: converted.time,
            }
        })
        .collect();

    let page = AnnotationPage {
        dataset_id: dataset_id.to_owned(),
        local_id: local_id.to_owned(),
        page_id: page_id_from_media(&target_id),
        target_id,
        language,
        original_lang: preview.original_lang(),
        source: preview.source().map(str::to_owned),
        annotations,
        resource,
        last_modified: now,
        deprecated: false,
    };
    page.key()
        .validate()
        .map_err(|err| anyhow::anyhow!("unusable page key {}: {err}", page.key()))?;
    Ok(page)
}

/// Runs conversion and assembly for one preview.
pub fn build_page(
    preview: &AnnotationPreview,
    now: DateTime<Utc>,
) -> Result<AnnotationPage, ConvertError> {
    let converted = convert::convert(preview.payload(), preview.format())?;
    assemble(preview, converted, now).map_err(|err| ConvertError::Parsing(format!("{err:#}")))
}

/// Direct submission: converts a local payload file, prints the page JSON and
/// optionally upserts it into a local store.
pub async fn submit(args: ConvertArgs) -> anyhow::Result<AnnotationPage> {
    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("read payload: {}", args.input.display()))?;
    let payload = convert::decode_payload(bytes)?;

    let mut builder = AnnotationPreview::builder()
        .record_id(&args.record_id)
        .media(&args.media)
        .language(&args.language)
        .format(&args.format)
        .original_lang(args.original_lang)
        .payload(payload);
    if let Some(rights) = &args.rights {
        builder = builder.rights(rights);
    }
    let preview = builder.build().context("invalid submission")?;

    let page = build_page(&preview, Utc::now())?;
    tracing::debug!(page = %page.key(), annotations = page.annotations.len(), "converted submission");

    if let Some(dir) = args.store_dir.as_deref() {
        let store = LocalFsAnnotationStore::open(dir)
            .await
            .with_context(|| format!("open annotation store: {}", dir.display()))?;
        let outcome = store.upsert_pages(std::slice::from_ref(&page)).await?;
        tracing::info!(
            page = %page.key(),
            new = outcome.new,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "stored submission"
        );
    }

    let json = serde_json::to_string_pretty(&page).context("serialize annotation page")?;
    println!("{json}");
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnnotationType;

    fn preview() -> anyhow::Result<AnnotationPreview> {
        AnnotationPreview::builder()
            .record_id("/9200/abc")
            .media("https://Media.Example.org/files/clip%201.mp4")
            .language("en")
            .rights("http://creativecommons.org/publicdomain/zero/1.0/")
            .format("text/vtt")
            .payload("WEBVTT\n\n00:00.000 --> 00:01.000\nHello\n\n00:01.000 --> 00:02.000\nWorld\n")
            .source("https://annotations.example/annotation/7")
            .build()
    }

    #[test]
    fn page_id_is_readable_and_stable() {
        assert_eq!(
            page_id_from_media("https://Media.Example.org/files/clip%201.mp4"),
            "media.example.org-files-clip-201.mp4"
        );
        assert_eq!(
            page_id_from_media("http://Media.Example.org/files/clip%201.mp4"),
            page_id_from_media("https://media.example.org/files/clip%201.mp4")
        );
    }

    #[test]
    fn assembles_page_with_shared_resource() -> anyhow::Result<()> {
        let now = Utc::now();
        let page = build_page(&preview()?, now)?;

        assert_eq!(page.dataset_id, "9200");
        assert_eq!(page.local_id, "abc");
        assert_eq!(page.page_id, "media.example.org-files-clip-201.mp4");
        assert_eq!(page.resource.value, "Hello World");
        assert_eq!(page.resource.record_uri, "http://data.europeana.eu/item/9200/abc");
        assert_eq!(page.source.as_deref(), Some("https://annotations.example/annotation/7"));
        assert_eq!(page.last_modified, now);
        assert!(!page.deprecated);
        assert_eq!(page.annotations.len(), 3);
        assert_eq!(page.annotations[0].kind, AnnotationType::Media);
        assert!(page.annotations.iter().all(|a| a.resource_id == page.resource.id));
        assert_eq!(page.text_of(&page.annotations[2].text), Some("World"));
        Ok(())
    }

    #[test]
    fn scope_from_the_source_is_kept_as_record_uri() -> anyhow::Result<()> {
        let preview = AnnotationPreview::builder()
            .record_id("/9200/abc")
            .record_uri("https://data.example.org/item/9200/abc")
            .media("https://media.example/clip.mp4")
            .language("en")
            .format("text/plain")
            .payload("hello")
            .build()?;
        let page = build_page(&preview, Utc::now())?;
        assert_eq!(page.resource.record_uri, "https://data.example.org/item/9200/abc");
        Ok(())
    }

    #[test]
    fn keys_that_cannot_be_stored_fail_conversion() -> anyhow::Result<()> {
        let slashed = AnnotationPreview::builder()
            .record_id("/9200/abc")
            .media("https://media.example/clip.mp4")
            .language("en/gb")
            .format("text/plain")
            .payload("hello")
            .build()?;
        let err = build_page(&slashed, Utc::now()).unwrap_err();
        assert!(matches!(err, ConvertError::Parsing(ref message) if message.contains("en/gb")));

        let empty_page_id = AnnotationPreview::builder()
            .record_id("/9200/abc")
            .media("%%%")
            .language("en")
            .format("text/plain")
            .payload("hello")
            .build()?;
        assert!(build_page(&empty_page_id, Utc::now()).is_err());
        Ok(())
    }

    #[test]
    fn rebuilding_yields_identical_ids() -> anyhow::Result<()> {
        let first = build_page(&preview()?, Utc::now())?;
        let second = build_page(&preview()?, Utc::now())?;
        assert!(first.same_content(&second));
        let ids = first.annotations.iter().map(|a| &a.id).collect::<Vec<_>>();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
        Ok(())
    }
}
