//! Handle on the external `yt-dlp` binary and the argument lists used to
//! drive it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::models::{MediaFormat, Quality};

/// Retries passed through to the tool for extractor failures.
pub const EXTRACTOR_RETRIES: u32 = 3;
/// Per-network-operation timeout passed through to the tool.
pub const SOCKET_TIMEOUT_SECS: u32 = 30;

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `--dump-json` invocation that prints one metadata document and never
    /// touches media bytes.
    pub fn metadata_command(&self, url: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(metadata_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Download invocation with newline-delimited progress on stdout.
    pub fn download_command(&self, selector: &str, output_template: &Path, url: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(download_args(selector, output_template, url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn policy_args() -> [String; 4] {
    [
        "--extractor-retries".to_string(),
        EXTRACTOR_RETRIES.to_string(),
        "--socket-timeout".to_string(),
        SOCKET_TIMEOUT_SECS.to_string(),
    ]
}

fn metadata_args(url: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--dump-json",
        "--no-download",
        "--no-playlist",
        "--ignore-errors",
        "--no-warnings",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.extend(policy_args().into_iter().map(OsString::from));
    args.push(url.into());
    args
}

fn download_args(selector: &str, output_template: &Path, url: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--format".into(),
        selector.into(),
        "--output".into(),
        output_template.as_os_str().to_owned(),
        "--newline".into(),
        "--no-playlist".into(),
        "--ignore-errors".into(),
        "--no-warnings".into(),
    ];
    args.extend(policy_args().into_iter().map(OsString::from));
    args.push(url.into());
    args
}

/// Format selector for a quality/format pair. Audio-only formats ignore the
/// quality tier entirely.
pub fn format_selector(quality: Quality, format: MediaFormat) -> String {
    if format.is_audio_only() {
        return "bestaudio/best".to_string();
    }
    format!("best[height<={}]/best", quality.height())
}

/// Output path template. The download id prefix keeps concurrent jobs from
/// colliding even when two of them fetch the same video.
pub fn output_template(download_dir: &Path, download_id: u64) -> PathBuf {
    download_dir.join(format!("{download_id}_%(title)s.%(ext)s"))
}
