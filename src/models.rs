//! Records held by the job store and the payloads exposed to API clients.
//!
//! Every struct serializes with camelCase keys because that is what the
//! browser client consumes.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resolution tiers a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::P2160,
        Quality::P1440,
        Quality::P1080,
        Quality::P720,
        Quality::P480,
        Quality::P360,
    ];

    /// Maximum pixel height this tier allows.
    pub fn height(self) -> u32 {
        match self {
            Self::P2160 => 2160,
            Self::P1440 => 1440,
            Self::P1080 => 1080,
            Self::P720 => 720,
            Self::P480 => 480,
            Self::P360 => 360,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P2160 => "2160p",
            Self::P1440 => "1440p",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
        }
    }
}

impl FromStr for Quality {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|quality| quality.as_str() == value)
            .ok_or(())
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container/codec choices. `mp3` and `m4a` are audio-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    #[default]
    Mp4,
    Webm,
    Mp3,
    M4a,
}

impl MediaFormat {
    pub const ALL: [MediaFormat; 4] = [
        MediaFormat::Mp4,
        MediaFormat::Webm,
        MediaFormat::Mp3,
        MediaFormat::M4a,
    ];

    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3 | Self::M4a)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
        }
    }
}

impl FromStr for MediaFormat {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == value)
            .ok_or(())
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download job lifecycle: `pending -> downloading -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Normalized metadata as returned by the metadata fetcher and the
/// `/api/video/info` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub duration: String,
    pub thumbnail: String,
    pub channel: String,
    pub views: String,
    pub upload_date: String,
    pub available_qualities: Vec<String>,
}

/// Cached metadata for one external video id. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub video_id: String,
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub duration: String,
    pub thumbnail: String,
    pub channel: String,
    pub views: String,
    pub upload_date: String,
    pub available_qualities: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Video {
    pub fn info(&self) -> VideoInfo {
        VideoInfo {
            id: self.video_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            duration: self.duration.clone(),
            thumbnail: self.thumbnail.clone(),
            channel: self.channel.clone(),
            views: self.views.clone(),
            upload_date: self.upload_date.clone(),
            available_qualities: self.available_qualities.clone(),
        }
    }
}

/// Fields supplied when caching a freshly fetched video.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub url: String,
    pub info: VideoInfo,
}

/// One download attempt. Mutated by the orchestrator as output arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: u64,
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub quality: Quality,
    pub format: MediaFormat,
    pub status: DownloadStatus,
    pub progress: u8,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<String>,
    pub download_speed: Option<String>,
    pub eta: Option<String>,
    pub error: Option<String>,
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when a download request is accepted. Status, progress,
/// id, and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub quality: Quality,
    pub format: MediaFormat,
    pub thumbnail: Option<String>,
}

/// Partial update merged into an existing download. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadUpdate {
    pub status: Option<DownloadStatus>,
    pub progress: Option<u8>,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<String>,
    pub download_speed: Option<String>,
    pub eta: Option<String>,
    pub error: Option<String>,
}

impl DownloadUpdate {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(DownloadStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn completed(file_path: Option<PathBuf>) -> Self {
        Self {
            status: Some(DownloadStatus::Completed),
            progress: Some(100),
            file_path,
            ..Self::default()
        }
    }
}

/// Structured update pushed to real-time subscribers and returned by the
/// progress endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub id: u64,
    pub status: DownloadStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Current state of a stored job, as reported by the progress endpoint.
    pub fn snapshot(download: &Download) -> Self {
        Self {
            id: download.id,
            status: download.status,
            progress: download.progress,
            download_speed: download.download_speed.clone(),
            eta: download.eta.clone(),
            error: download.error.clone(),
        }
    }
}

/// Row returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub id: u64,
    pub url: String,
    pub title: String,
    pub quality: Quality,
    pub format: MediaFormat,
    pub status: DownloadStatus,
    pub progress: u8,
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Download> for DownloadSummary {
    fn from(download: &Download) -> Self {
        Self {
            id: download.id,
            url: download.url.clone(),
            title: download.title.clone(),
            quality: download.quality,
            format: download.format,
            status: download.status,
            progress: download.progress,
            thumbnail: download.thumbnail.clone(),
            created_at: download.created_at,
            completed_at: download.completed_at,
        }
    }
}
