#![forbid(unsafe_code)]

//! Guards shared by the binaries: who may run them, and which client-supplied
//! names may touch the served directory.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start as root: uploads and downloads would end up owned by root
/// inside a user's media directory.
pub fn ensure_not_root(process: &str) -> Result<()> {
    check_uid(Uid::current(), process)
}

fn check_uid(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("refusing to run {process} as root; start it as the user who owns the media directory");
    }
    Ok(())
}

/// Accepts `a/b.mp4`-style relative paths and rejects anything that could leave
/// the base directory (`..`, absolute paths, drive prefixes, empty names).
pub fn safe_relative_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(candidate.to_path_buf())
}

/// Reduces a client file name to its final component. Hidden names (including
/// macOS `._` resource forks) are refused so they never show up in listings.
pub fn upload_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if last.is_empty() || last.starts_with('.') {
        return None;
    }
    Some(last.to_string())
}
