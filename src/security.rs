#![forbid(unsafe_code)]

//! Process and filesystem guards shared by the backend.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the backend is started as root. yt-dlp writes wherever the
/// output template points, so the process should never hold root's reach.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Returns the path when it stays inside `root` after lexical normalization.
///
/// Recorded file paths come from the external tool's output, so they are
/// checked before being served or removed. Relative paths are resolved
/// against `root`.
pub fn contained_path(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let root = normalize(root);
    let joined = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root.join(candidate))
    };
    if joined != root && joined.starts_with(&root) {
        Some(joined)
    } else {
        None
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
