//! Metadata fetcher: runs yt-dlp in dump-json mode and normalizes the result
//! into a [`VideoInfo`].

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::FetchError;
use crate::models::{NewVideo, Video, VideoInfo};
use crate::store::JobStore;
use crate::validators::extract_video_id;
use crate::ytdlp::YtDlp;

/// Subset of the `--dump-json` payload. Everything is optional because older
/// uploads and other extractors routinely omit fields.
#[derive(Debug, Default, Deserialize)]
struct RawVideoInfo {
    title: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    upload_date: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    vcodec: Option<String>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    tool: YtDlp,
}

impl MetadataFetcher {
    pub fn new(tool: YtDlp) -> Self {
        Self { tool }
    }

    /// Fetches and normalizes metadata for `url`. Unsupported URLs are
    /// rejected before any process is started.
    pub async fn fetch(&self, url: &str) -> Result<VideoInfo, FetchError> {
        let video_id = extract_video_id(url).ok_or(FetchError::InvalidUrl)?;

        tracing::info!(url, binary = %self.tool.binary().display(), "fetching video metadata");
        let output = self
            .tool
            .metadata_command(url)
            .output()
            .await
            .map_err(FetchError::ToolUnavailable)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(url, status = %output.status, stderr = %stderr, "metadata command failed");
            let diagnostic = if stderr.is_empty() {
                "Unknown error".to_string()
            } else {
                stderr
            };
            return Err(FetchError::Extraction(diagnostic));
        }

        let raw: RawVideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(normalize(video_id, raw))
    }
}

/// Returns the cached video for `url`, fetching and caching it on a miss.
pub async fn lookup_or_fetch(
    store: &JobStore,
    fetcher: &MetadataFetcher,
    url: &str,
) -> Result<Video, FetchError> {
    let video_id = extract_video_id(url).ok_or(FetchError::InvalidUrl)?;
    if let Some(video) = store.get_video(video_id) {
        return Ok(video);
    }
    let info = fetcher.fetch(url).await?;
    Ok(store.create_video(NewVideo {
        url: url.to_string(),
        info,
    }))
}

fn normalize(video_id: &str, raw: RawVideoInfo) -> VideoInfo {
    let duration = raw.duration.unwrap_or(0.0).max(0.0) as u64;
    VideoInfo {
        id: video_id.to_string(),
        title: non_empty(raw.title).unwrap_or_else(|| "Unknown Title".to_string()),
        description: Some(raw.description.unwrap_or_default()),
        duration: format_duration(duration),
        thumbnail: raw.thumbnail.unwrap_or_default(),
        channel: non_empty(raw.uploader)
            .or_else(|| non_empty(raw.channel))
            .unwrap_or_else(|| "Unknown Channel".to_string()),
        views: format_views(raw.view_count.unwrap_or(0)),
        upload_date: raw
            .upload_date
            .as_deref()
            .and_then(format_upload_date)
            .unwrap_or_else(|| "Unknown".to_string()),
        available_qualities: available_qualities(&raw.formats),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Renders durations as `H:MM:SS` or `M:SS` for anything under an hour.
pub fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

pub fn format_views(views: u64) -> String {
    if views >= 1_000_000 {
        format!("{:.1}M", views as f64 / 1_000_000.0)
    } else if views >= 1_000 {
        format!("{:.1}K", views as f64 / 1_000.0)
    } else {
        views.to_string()
    }
}

/// Converts yt-dlp's `YYYYMMDD` upload date into `YYYY-MM-DD`.
pub fn format_upload_date(value: &str) -> Option<String> {
    let value = value.trim();
    if value.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Distinct `{height}p` labels of every format carrying video, tallest first.
fn available_qualities(formats: &[FormatInfo]) -> Vec<String> {
    let heights: BTreeSet<u32> = formats
        .iter()
        .filter(|format| format.vcodec.as_deref() != Some("none"))
        .filter_map(|format| format.height)
        .filter(|height| *height > 0)
        .collect();
    heights
        .into_iter()
        .rev()
        .map(|height| format!("{height}p"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::install_stub;
    use tempfile::tempdir;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(125), "2:05");
        assert_eq!(format_duration(3725), "1:02:05");
        assert_eq!(format_duration(36000), "10:00:00");
    }

    #[test]
    fn view_formatting() {
        assert_eq!(format_views(999), "999");
        assert_eq!(format_views(1500), "1.5K");
        assert_eq!(format_views(2_500_000), "2.5M");
        assert_eq!(format_views(1_000), "1.0K");
    }

    #[test]
    fn upload_date_formatting() {
        assert_eq!(format_upload_date("20240131").as_deref(), Some("2024-01-31"));
        assert_eq!(format_upload_date("2024013"), None);
        assert_eq!(format_upload_date("20241399"), None);
    }

    #[test]
    fn qualities_skip_audio_and_dedupe() {
        let formats = vec![
            FormatInfo {
                vcodec: Some("none".into()),
                height: None,
            },
            FormatInfo {
                vcodec: Some("avc1".into()),
                height: Some(360),
            },
            FormatInfo {
                vcodec: Some("vp9".into()),
                height: Some(1080),
            },
            FormatInfo {
                vcodec: Some("avc1".into()),
                height: Some(1080),
            },
            FormatInfo {
                vcodec: None,
                height: Some(720),
            },
            FormatInfo {
                vcodec: Some("none".into()),
                height: Some(480),
            },
            FormatInfo {
                vcodec: Some("avc1".into()),
                height: None,
            },
        ];
        assert_eq!(available_qualities(&formats), vec!["1080p", "720p", "360p"]);
    }

    #[test]
    fn normalize_applies_fallbacks() {
        let info = normalize("abc", RawVideoInfo::default());
        assert_eq!(info.id, "abc");
        assert_eq!(info.title, "Unknown Title");
        assert_eq!(info.channel, "Unknown Channel");
        assert_eq!(info.views, "0");
        assert_eq!(info.duration, "0:00");
        assert_eq!(info.upload_date, "Unknown");
        assert_eq!(info.description.as_deref(), Some(""));
        assert!(info.available_qualities.is_empty());
    }

    #[test]
    fn normalize_prefers_uploader_over_channel() {
        let info = normalize(
            "abc",
            RawVideoInfo {
                uploader: Some("Uploader".into()),
                channel: Some("Channel".into()),
                ..RawVideoInfo::default()
            },
        );
        assert_eq!(info.channel, "Uploader");
    }

    #[tokio::test]
    async fn invalid_url_never_spawns() {
        let fetcher = MetadataFetcher::new(YtDlp::new("/nonexistent/yt-dlp"));
        let err = fetcher.fetch("https://vimeo.com/1").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl));
    }

    #[tokio::test]
    async fn missing_binary_is_tool_unavailable() {
        let fetcher = MetadataFetcher::new(YtDlp::new("/nonexistent/yt-dlp"));
        let err = fetcher.fetch("https://youtu.be/abc123").await.unwrap_err();
        assert!(matches!(err, FetchError::ToolUnavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_parses_stub_output() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"cat <<'JSON'
{"title":"Sample","description":"desc","duration":3725,"thumbnail":"https://img.test/t.jpg",
 "uploader":"Uploader","view_count":2500000,"upload_date":"20240101",
 "formats":[{"vcodec":"avc1","height":720},{"vcodec":"none","height":null},{"vcodec":"vp9","height":1080}]}
JSON
"#,
        );
        let fetcher = MetadataFetcher::new(YtDlp::new(stub));
        let info = fetcher.fetch("https://youtu.be/abc123").await.unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.title, "Sample");
        assert_eq!(info.duration, "1:02:05");
        assert_eq!(info.views, "2.5M");
        assert_eq!(info.upload_date, "2024-01-01");
        assert_eq!(info.available_qualities, vec!["1080p", "720p"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'ERROR: [youtube] abc123: Video unavailable' >&2\nexit 1\n",
        );
        let fetcher = MetadataFetcher::new(YtDlp::new(stub));
        let err = fetcher.fetch("https://youtu.be/abc123").await.unwrap_err();
        match err {
            FetchError::Extraction(message) => assert!(message.contains("Video unavailable")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbage_output_is_malformed() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo 'not json'\n");
        let fetcher = MetadataFetcher::new(YtDlp::new(stub));
        let err = fetcher.fetch("https://youtu.be/abc123").await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedMetadata(_)));
    }

    #[tokio::test]
    async fn lookup_prefers_cached_video() {
        let store = JobStore::new();
        store.create_video(NewVideo {
            url: "https://youtu.be/abc123".into(),
            info: normalize("abc123", RawVideoInfo::default()),
        });
        let fetcher = MetadataFetcher::new(YtDlp::new("/nonexistent/yt-dlp"));
        let video = lookup_or_fetch(&store, &fetcher, "https://www.youtube.com/watch?v=abc123")
            .await
            .unwrap();
        assert_eq!(video.video_id, "abc123");
        assert_eq!(video.url, "https://youtu.be/abc123");
    }
}
