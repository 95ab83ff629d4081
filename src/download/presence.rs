// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! "Do we already have it?" check run between resolution and transfer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use super::http::probe_remote_size;
use super::paths::split_extension;

/// Result of the local presence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Nothing usable on disk; download.
    Absent,
    /// The exact target file exists with an acceptable size.
    Present(PathBuf),
    /// A file with the same base name exists, typically an extracted payload.
    Extracted(PathBuf),
}

/// Remote size for the comparison: the provider's figure, else a HEAD probe.
pub struct RemoteSize<'a> {
    client: &'a Client,
    url: &'a str,
    timeout: Duration,
    known: Option<Option<u64>>,
}

impl<'a> RemoteSize<'a> {
    pub fn new(client: &'a Client, url: &'a str, hint: Option<u64>, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
            known: hint.map(Some),
        }
    }

    async fn get(&mut self) -> Option<u64> {
        if let Some(known) = self.known {
            return known;
        }
        let probed = probe_remote_size(self.client, self.url, self.timeout).await;
        self.known = Some(probed);
        probed
    }
}

/// Decide whether `target` needs downloading.
///
/// An exact match with equal size, or with an unknown remote size, is present.
/// A size mismatch removes the stale file. When the exact file is missing,
/// the directory is scanned for the same base name under another extension
/// with the same size policy (mismatches there are left alone).
pub async fn check_existing(target: &Path, remote: &mut RemoteSize<'_>) -> Result<Presence> {
    if let Ok(meta) = tokio::fs::metadata(target).await {
        if meta.is_file() {
            let local = meta.len();
            match remote.get().await {
                Some(size) if size != local => {
                    tracing::warn!(
                        target: "download::presence",
                        "Size mismatch for {:?} (local {}, remote {}), downloading again",
                        target, local, size
                    );
                    match tokio::fs::remove_file(target).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| format!("Failed to remove stale file: {:?}", target))
                        }
                    }
                    return Ok(Presence::Absent);
                }
                _ => return Ok(Presence::Present(target.to_path_buf())),
            }
        }
    }

    let Some(sibling) = same_base_name(target).await else {
        return Ok(Presence::Absent);
    };
    let local = tokio::fs::metadata(&sibling).await.map(|m| m.len()).ok();
    match (local, remote.get().await) {
        (Some(local), Some(size)) if local != size => {
            tracing::debug!(
                target: "download::presence",
                "{:?} shares the base name but not the size, downloading", sibling
            );
            Ok(Presence::Absent)
        }
        _ => Ok(Presence::Extracted(sibling)),
    }
}

/// Stem of a file name that ends in a real extension.
fn stem_of(path: &Path) -> Option<&str> {
    match split_extension(path.file_name()?.to_str()?) {
        (stem, Some(_)) => Some(stem),
        (_, None) => None,
    }
}

/// First file in the target's directory with the same stem and another extension.
async fn same_base_name(target: &Path) -> Option<PathBuf> {
    // Only meaningful when the target has an extension to differ by
    let stem = stem_of(target)?.to_string();
    let dir = target.parent()?;

    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == target || is_scratch(&path) {
            continue;
        }
        if stem_of(&path) == Some(stem.as_str()) && entry.file_type().await.is_ok_and(|t| t.is_file()) {
            matches.push(path);
        }
    }
    matches.sort();
    matches.into_iter().next()
}

/// In-progress and temp artifacts never count as a finished download.
fn is_scratch(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("part") | Some("tmp") | Some("lock")
    )
}
