use crate::cues::{self, SubtitleFormat};
use crate::error::ConvertError;
use crate::model::{AnnotationType, TextBoundary, TimeBoundary};

/// Inserted between consecutive cues in the resource text.
pub const CUE_SEPARATOR: char = ' ';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedAnnotation {
    pub kind: AnnotationType,
    pub text: TextBoundary,
    pub time: Option<TimeBoundary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedSubtitles {
    /// Cue texts joined by [`CUE_SEPARATOR`].
    pub text: String,
    /// Always starts with the whole-resource media annotation.
    pub annotations: Vec<ConvertedAnnotation>,
}

pub fn decode_payload(bytes: Vec<u8>) -> Result<String, ConvertError> {
    String::from_utf8(bytes)
        .map_err(|err| ConvertError::Parsing(format!("payload is not valid UTF-8: {err}")))
}

pub fn convert(payload: &str, mime: &str) -> Result<ConvertedSubtitles, ConvertError> {
    let format = SubtitleFormat::from_mime(mime)?;
    let cues = cues::parse(format, payload)?;
    let kind = match format {
        SubtitleFormat::Plain => AnnotationType::Line,
        _ => AnnotationType::Caption,
    };

    let mut text = String::new();
    let mut annotations = Vec::with_capacity(cues.len() + 1);
    annotations.push(ConvertedAnnotation {
        kind: AnnotationType::Media,
        text: TextBoundary::WHOLE_RESOURCE,
        time: None,
    });

    // Offsets count chars, so the separator always advances the cursor by one.
    let mut cursor = 0u32;
    for (idx, cue) in cues.iter().enumerate() {
        if idx > 0 {
            text.push(CUE_SEPARATOR);
            cursor += 1;
        }
        let len = u32::try_from(cue.text.chars().count()).map_err(|_| {
            ConvertError::Parsing("cue text is longer than u32::MAX characters".to_owned())
        })?;
        text.push_str(&cue.text);

        let time = cue
            .timing
            .map(|t| TimeBoundary::new(t.start_ms, t.start_ms.saturating_add(t.duration_ms)))
            .filter(TimeBoundary::is_valid);
        annotations.push(ConvertedAnnotation {
            kind,
            text: TextBoundary::new(cursor, cursor + len),
            time,
        });
        cursor += len;
    }

    Ok(ConvertedSubtitles { text, annotations })
}
