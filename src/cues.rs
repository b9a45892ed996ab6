use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConvertError;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static TTML_P_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<p\b([^>]*?)(?:/>|>(.*?)</p\s*>)").expect("valid ttml paragraph regex")
});
static TTML_P_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<p[\s>/]").expect("valid ttml open regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attr regex")
});
static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid entity regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    WebVtt,
    SubRip,
    Ttml,
    Plain,
}

impl SubtitleFormat {
    pub fn from_mime(mime: &str) -> Result<Self, ConvertError> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/vtt" => Ok(Self::WebVtt),
            "application/x-subrip" | "application/srt" | "text/srt" => Ok(Self::SubRip),
            "application/ttml+xml" | "application/xml+ttml" | "text/ttml" => Ok(Self::Ttml),
            "text/plain" => Ok(Self::Plain),
            _ => Err(ConvertError::invalid_format(mime, "unsupported subtitle format")),
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::WebVtt => "text/vtt",
            Self::SubRip => "application/x-subrip",
            Self::Ttml => "application/ttml+xml",
            Self::Plain => "text/plain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueTiming {
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl CueTiming {
    fn between(start_ms: u64, end_ms: u64) -> Self {
        Self {
            start_ms,
            duration_ms: end_ms.saturating_sub(start_ms),
        }
    }
}

/// One parsed unit of text, markup already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub timing: Option<CueTiming>,
    pub text: String,
}

pub fn parse(format: SubtitleFormat, payload: &str) -> Result<Vec<Cue>, ConvertError> {
    let payload = payload.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let cues = match format {
        SubtitleFormat::WebVtt => parse_webvtt(&payload)?,
        SubtitleFormat::SubRip => parse_subrip(&payload)?,
        SubtitleFormat::Ttml => parse_ttml(&payload)?,
        SubtitleFormat::Plain => parse_plain(&payload),
    };
    Ok(cues.into_iter().filter(|cue| !cue.text.is_empty()).collect())
}

/// Removes inline markup and decodes entities, collapsing whitespace.
pub fn clean_text(raw: &str) -> String {
    let without_breaks = BR_RE.replace_all(raw, " ");
    let without_tags = TAG_RE.replace_all(&without_breaks, "");
    let decoded = decode_entities(&without_tags);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(input: &str) -> String {
    let numeric = NUMERIC_ENTITY_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    numeric
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&lrm;", "")
        .replace("&rlm;", "")
        .replace("&amp;", "&")
}

fn blocks(payload: &str) -> impl Iterator<Item = Vec<&str>> {
    payload
        .split("\n\n")
        .map(|block| {
            block
                .lines()
                .filter(|line| !line.trim().is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|lines| !lines.is_empty())
}

fn parse_webvtt(payload: &str) -> Result<Vec<Cue>, ConvertError> {
    let mime = SubtitleFormat::WebVtt.mime();
    let first_line = payload.lines().next().unwrap_or_default();
    let has_signature = first_line == "WEBVTT"
        || first_line.starts_with("WEBVTT ")
        || first_line.starts_with("WEBVTT\t");
    if !has_signature {
        return Err(ConvertError::invalid_format(mime, "missing WEBVTT signature"));
    }

    let mut cues = Vec::new();
    for lines in blocks(payload).skip(1) {
        let head = lines[0].trim_start();
        if head.starts_with("NOTE") || head.starts_with("STYLE") || head.starts_with("REGION") {
            continue;
        }
        let Some(timing_idx) = lines.iter().take(2).position(|l| l.contains("-->")) else {
            return Err(ConvertError::invalid_format(
                mime,
                format!("cue without timing line: {head:?}"),
            ));
        };
        let timing = parse_timing_line(lines[timing_idx], mime, '.')?;
        cues.push(Cue {
            timing: Some(timing),
            text: clean_text(&lines[timing_idx + 1..].join(" ")),
        });
    }
    Ok(cues)
}

fn parse_subrip(payload: &str) -> Result<Vec<Cue>, ConvertError> {
    let mime = SubtitleFormat::SubRip.mime();
    if payload.trim().is_empty() {
        return Err(ConvertError::invalid_format(mime, "payload is empty"));
    }

    let mut cues = Vec::new();
    for lines in blocks(payload) {
        let timing_idx = match lines.iter().take(2).position(|l| l.contains("-->")) {
            Some(0) => 0,
            Some(1) if lines[0].trim().parse::<u64>().is_ok() => 1,
            _ => {
                return Err(ConvertError::invalid_format(
                    mime,
                    format!("malformed cue block starting with {:?}", lines[0]),
                ));
            }
        };
        let timing = parse_timing_line(lines[timing_idx], mime, ',')?;
        cues.push(Cue {
            timing: Some(timing),
            text: clean_text(&lines[timing_idx + 1..].join(" ")),
        });
    }
    Ok(cues)
}

fn parse_timing_line(line: &str, mime: &str, fraction_sep: char) -> Result<CueTiming, ConvertError> {
    let (start, rest) = line
        .split_once("-->")
        .ok_or_else(|| ConvertError::invalid_format(mime, format!("bad timing line: {line:?}")))?;
    // Anything after the end timestamp is cue settings.
    let end = rest.split_whitespace().next().unwrap_or_default();
    let start_ms = parse_clock(start.trim(), fraction_sep)
        .ok_or_else(|| ConvertError::invalid_format(mime, format!("bad timestamp: {start:?}")))?;
    let end_ms = parse_clock(end, fraction_sep)
        .ok_or_else(|| ConvertError::invalid_format(mime, format!("bad timestamp: {end:?}")))?;
    Ok(CueTiming::between(start_ms, end_ms))
}

/// Parses `[hh:]mm:ss[<sep>fff]` into milliseconds.
fn parse_clock(raw: &str, fraction_sep: char) -> Option<u64> {
    let (clock, fraction) = match raw.split_once(fraction_sep) {
        Some((clock, fraction)) => (clock, Some(fraction)),
        // SubRip files in the wild use both separators.
        None => match raw.split_once('.') {
            Some((clock, fraction)) => (clock, Some(fraction)),
            None => (raw, None),
        },
    };

    let parts = clock
        .split(':')
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                p.parse::<u64>().ok()
            }
        })
        .collect::<Option<Vec<_>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    let millis = match fraction {
        None => 0,
        Some(f) if !f.is_empty() && f.len() <= 3 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let padded = format!("{f:0<3}");
            padded.parse::<u64>().ok()?
        }
        Some(_) => return None,
    };

    hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

fn parse_ttml(payload: &str) -> Result<Vec<Cue>, ConvertError> {
    let mime = SubtitleFormat::Ttml.mime();
    if !payload.contains("<tt") {
        return Err(ConvertError::invalid_format(mime, "missing <tt> root element"));
    }

    let opened = TTML_P_OPEN_RE.find_iter(payload).count();
    let mut cues = Vec::new();
    for caps in TTML_P_RE.captures_iter(payload) {
        let attrs = parse_attributes(caps.get(1).map(|m| m.as_str()).unwrap_or_default());
        let begin = attr(&attrs, "begin")
            .ok_or_else(|| ConvertError::invalid_format(mime, "<p> without begin attribute"))?;
        let start_ms = parse_ttml_time(begin)
            .ok_or_else(|| ConvertError::invalid_format(mime, format!("bad begin: {begin:?}")))?;
        let end_ms = match (attr(&attrs, "end"), attr(&attrs, "dur")) {
            (Some(end), _) => parse_ttml_time(end)
                .ok_or_else(|| ConvertError::invalid_format(mime, format!("bad end: {end:?}")))?,
            (None, Some(dur)) => {
                let dur_ms = parse_ttml_time(dur).ok_or_else(|| {
                    ConvertError::invalid_format(mime, format!("bad dur: {dur:?}"))
                })?;
                start_ms.saturating_add(dur_ms)
            }
            (None, None) => {
                return Err(ConvertError::invalid_format(
                    mime,
                    "<p> without end or dur attribute",
                ));
            }
        };
        cues.push(Cue {
            timing: Some(CueTiming::between(start_ms, end_ms)),
            text: clean_text(caps.get(2).map(|m| m.as_str()).unwrap_or_default()),
        });
    }

    if cues.len() != opened {
        return Err(ConvertError::Parsing(format!(
            "unterminated <p> element ({opened} opened, {} closed)",
            cues.len()
        )));
    }
    Ok(cues)
}

fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            (caps[1].to_owned(), value.to_owned())
        })
        .collect()
}

/// Looks an attribute up by local name, ignoring any namespace prefix.
fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key.rsplit(':').next() == Some(name))
        .map(|(_, value)| value.as_str())
}

fn parse_ttml_time(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.contains(':') {
        return parse_clock(raw, '.');
    }

    let split = raw.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = raw.split_at(split);
    let value = value.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let factor = match unit {
        "h" => 3_600_000.0,
        "m" => 60_000.0,
        "s" => 1_000.0,
        "ms" => 1.0,
        _ => return None,
    };
    Some((value * factor).round() as u64)
}

fn parse_plain(payload: &str) -> Vec<Cue> {
    payload
        .lines()
        .map(|line| Cue {
            timing: None,
            text: clean_text(line),
        })
        .collect()
}
