//! Classifies single lines of yt-dlp `--newline` output.
//!
//! The orchestrator only ever sees [`ProgressLine`]; the textual patterns
//! live here so a change in the tool's output format stays local.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[download\]\s+(?P<percent>\d+(?:\.\d+)?)%\s+of\s+~?\s*(?P<size>[\d.]+\s*\w+)\s+at\s+(?P<speed>[\d.]+\s*\w+/s)\s+ETA\s+(?P<eta>[\d:]+)",
    )
    .expect("progress pattern compiles")
});

static DESTINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\] Destination: (?P<path>.+)$").expect("destination pattern compiles")
});

static FINISHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+100%").expect("finished pattern compiles"));

static ALREADY_DOWNLOADED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(?P<path>.+?) has already been downloaded")
        .expect("already-downloaded pattern compiles")
});

/// Numbers pulled from one progress line. Size, speed, and ETA stay in the
/// tool's human-readable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub percent: u8,
    pub size: String,
    pub speed: String,
    pub eta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressLine {
    Progress(ProgressReport),
    Destination(PathBuf),
    /// The file is complete. `path` is set when the line itself names it.
    Complete { path: Option<PathBuf> },
    Unmatched,
}

pub fn parse_line(line: &str) -> ProgressLine {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(captures) = ALREADY_DOWNLOADED.captures(line) {
        return ProgressLine::Complete {
            path: Some(PathBuf::from(captures["path"].trim())),
        };
    }
    if FINISHED.is_match(line) {
        return ProgressLine::Complete { path: None };
    }
    if let Some(captures) = PROGRESS.captures(line) {
        let percent = captures["percent"].parse::<f64>().unwrap_or(0.0);
        return ProgressLine::Progress(ProgressReport {
            percent: percent.round().clamp(0.0, 100.0) as u8,
            size: captures["size"].to_string(),
            speed: captures["speed"].to_string(),
            eta: captures["eta"].to_string(),
        });
    }
    if let Some(captures) = DESTINATION.captures(line) {
        return ProgressLine::Destination(PathBuf::from(captures["path"].trim()));
    }
    ProgressLine::Unmatched
}
