#![forbid(unsafe_code)]

//! Shared security helpers used by the cliptube binaries and storage layer.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The backend spawns ffmpeg on
/// user-supplied media, which should never happen with root privileges.
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

/// True when `value` is a non-empty relative path made only of normal
/// components, i.e. joining it onto a base directory cannot escape it.
pub fn is_safe_relative_path(value: &str) -> bool {
    !value.is_empty()
        && Path::new(value)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Reduces user-derived text (source ids, owner ids) to a single safe file
/// name segment: ASCII alphanumerics plus `-` and `_`, at most 64 chars.
pub fn sanitize_key_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
