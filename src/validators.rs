//! Boundary checks for incoming URLs and download requests.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{FieldViolation, ValidationError};
use crate::models::{MediaFormat, Quality};

static VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)(?P<id>[^&\n?#/]+)",
    )
    .expect("video url pattern compiles")
});

/// Returns the video id carried by a supported URL shape, or `None` when the
/// URL is not one of them.
pub fn extract_video_id(url: &str) -> Option<&str> {
    VIDEO_URL
        .captures(url.trim())
        .and_then(|captures| captures.name("id"))
        .map(|id| id.as_str())
}

pub fn is_valid_video_url(url: &str) -> bool {
    extract_video_id(url).is_some()
}

/// A download request that passed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub video_id: String,
    pub quality: Quality,
    pub format: MediaFormat,
}

/// Validates a raw JSON body against the accepted download-request shape,
/// collecting every violation before failing.
pub fn validate_download_request(body: &Value) -> Result<DownloadRequest, ValidationError> {
    let mut violations = Vec::new();

    let url = match body.get("url") {
        Some(Value::String(url)) => match extract_video_id(url) {
            Some(id) => Some((url.trim().to_string(), id.to_string())),
            None => {
                violations.push(violation("url", "Invalid YouTube URL format"));
                None
            }
        },
        Some(_) => {
            violations.push(violation("url", "Expected string"));
            None
        }
        None => {
            violations.push(violation("url", "Required"));
            None
        }
    };

    let quality = match body.get("quality") {
        Some(Value::String(raw)) => match raw.parse::<Quality>() {
            Ok(quality) => Some(quality),
            Err(()) => {
                violations.push(violation(
                    "quality",
                    format!(
                        "Invalid enum value. Expected {}, received '{raw}'",
                        expected_list(Quality::ALL.iter().map(|q| q.as_str()))
                    ),
                ));
                None
            }
        },
        Some(_) => {
            violations.push(violation("quality", "Expected string"));
            None
        }
        None => {
            violations.push(violation("quality", "Required"));
            None
        }
    };

    let format = match body.get("format") {
        None | Some(Value::Null) => Some(MediaFormat::default()),
        Some(Value::String(raw)) => match raw.parse::<MediaFormat>() {
            Ok(format) => Some(format),
            Err(()) => {
                violations.push(violation(
                    "format",
                    format!(
                        "Invalid enum value. Expected {}, received '{raw}'",
                        expected_list(MediaFormat::ALL.iter().map(|f| f.as_str()))
                    ),
                ));
                None
            }
        },
        Some(_) => {
            violations.push(violation("format", "Expected string"));
            None
        }
    };

    match (url, quality, format) {
        (Some((url, video_id)), Some(quality), Some(format)) if violations.is_empty() => {
            Ok(DownloadRequest {
                url,
                video_id,
                quality,
                format,
            })
        }
        _ => Err(ValidationError { violations }),
    }
}

fn violation(field: &'static str, message: impl Into<String>) -> FieldViolation {
    FieldViolation {
        field,
        message: message.into(),
    }
}

fn expected_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .map(|value| format!("'{value}'"))
        .collect::<Vec<_>>()
        .join(" | ")
}
