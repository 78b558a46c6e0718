//! Helpers shared by unit tests that drive a fake yt-dlp.

use std::fs;
use std::path::{Path, PathBuf};

/// Writes an executable bash script standing in for yt-dlp and returns its
/// path. `body` runs after `set -eu`; `$@` holds the tool arguments.
pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
    let script_path = dir.join("yt-dlp");
    let script = format!("#!/usr/bin/env bash\nset -eu\n{body}");
    fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}
