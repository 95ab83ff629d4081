// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive post-processing after a completed transfer.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

/// Archive formats we know how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    SevenZip,
}

impl ArchiveKind {
    /// Format for `path`, by extension.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "rar" => Some(ArchiveKind::Rar),
            "7z" => Some(ArchiveKind::SevenZip),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Cannot open archive {path:?}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Extraction tool `{0}` is not installed")]
    MissingTool(&'static str),

    #[error("`{tool}` failed with status {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: i32,
        stderr: String,
    },

    #[error("Extraction task failed: {0}")]
    Join(String),

    #[error("Failed to prepare {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What an extraction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    /// `None` when the file is not an archive we handle.
    pub kind: Option<ArchiveKind>,
    pub extracted: usize,
    /// Entries that could not be written.
    pub skipped: Vec<String>,
    /// Whether the source archive was deleted.
    pub archive_removed: bool,
}

impl ExtractReport {
    fn untouched() -> Self {
        Self { kind: None, extracted: 0, skipped: Vec::new(), archive_removed: false }
    }

    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn summary(&self) -> String {
        match (self.kind, self.is_partial()) {
            (None, _) => "No extraction needed".to_string(),
            (Some(_), false) => format!("Extracted {} files", self.extracted),
            (Some(_), true) => format!(
                "Extracted {} files, skipped {}: {}",
                self.extracted,
                self.skipped.len(),
                self.skipped.join(", ")
            ),
        }
    }
}

/// Unpacks archives next to where they were downloaded.
#[derive(Debug, Clone, Default)]
pub struct PostProcessor {
    unrar: Option<PathBuf>,
    seven_zip: Option<PathBuf>,
}

impl PostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `unrar` / `7z` binaries.
    pub fn with_tools(unrar: Option<PathBuf>, seven_zip: Option<PathBuf>) -> Self {
        Self { unrar, seven_zip }
    }

    /// Extract `archive` into `dest_dir`.
    ///
    /// Entry-level failures are collected in `skipped` and keep the archive
    /// on disk; a clean run deletes it. Unknown formats are left as-is.
    pub async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<ExtractReport, ExtractError> {
        let Some(kind) = ArchiveKind::detect(archive) else {
            tracing::debug!(target: "download::extract", "{:?} is not an archive, leaving as-is", archive);
            return Ok(ExtractReport::untouched());
        };

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| ExtractError::Io { path: dest_dir.to_path_buf(), source })?;

        tracing::info!(target: "download::extract", "Extracting {:?} ({:?})", archive, kind);
        let mut report = match kind {
            ArchiveKind::Zip => {
                let (archive_path, dest) = (archive.to_path_buf(), dest_dir.to_path_buf());
                tokio::task::spawn_blocking(move || extract_zip(&archive_path, &dest))
                    .await
                    .map_err(|e| ExtractError::Join(e.to_string()))??
            }
            ArchiveKind::Rar => {
                let tool = self.unrar.as_deref().unwrap_or(Path::new("unrar"));
                let mut dest_arg = dest_dir.as_os_str().to_os_string();
                dest_arg.push(std::path::MAIN_SEPARATOR_STR);
                run_tool("unrar", tool, &[OsStr::new("x"), OsStr::new("-o+"), archive.as_os_str(), dest_arg.as_os_str()])
                    .await?;
                ExtractReport { kind: Some(kind), extracted: 0, skipped: Vec::new(), archive_removed: false }
            }
            ArchiveKind::SevenZip => {
                let tool = self.seven_zip.as_deref().unwrap_or(Path::new("7z"));
                let mut out = OsString::from("-o");
                out.push(dest_dir.as_os_str());
                run_tool("7z", tool, &[OsStr::new("x"), OsStr::new("-y"), out.as_os_str(), archive.as_os_str()]).await?;
                ExtractReport { kind: Some(kind), extracted: 0, skipped: Vec::new(), archive_removed: false }
            }
        };

        if report.is_partial() {
            tracing::warn!(target: "download::extract", "{}", report.summary());
        } else {
            match tokio::fs::remove_file(archive).await {
                Ok(()) => report.archive_removed = true,
                Err(e) => tracing::warn!(target: "download::extract", "Could not remove {:?}: {}", archive, e),
            }
        }
        Ok(report)
    }
}

async fn run_tool(name: &'static str, program: &Path, args: &[&OsStr]) -> Result<(), ExtractError> {
    let output = match Command::new(program).args(args).output().await {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ExtractError::MissingTool(name)),
        Err(source) => return Err(ExtractError::Io { path: program.to_path_buf(), source }),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractError::ToolFailed {
            tool: name,
            status: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().lines().last().unwrap_or_default().to_string(),
        });
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<ExtractReport, ExtractError> {
    let open_err = |message: String| ExtractError::Open { path: archive.to_path_buf(), message };
    let file = fs::File::open(archive).map_err(|e| open_err(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| open_err(e.to_string()))?;

    let mut report = ExtractReport { kind: Some(ArchiveKind::Zip), extracted: 0, skipped: Vec::new(), archive_removed: false };
    for index in 0..zip.len() {
        let mut entry = match zip.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                report.skipped.push(format!("#{}", index));
                tracing::warn!(target: "download::extract", "Unreadable zip entry {}: {}", index, e);
                continue;
            }
        };
        let name = entry.name().to_string();
        // Entries escaping the destination are never written
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(target: "download::extract", "Skipping unsafe entry {}", name);
            report.skipped.push(name);
            continue;
        };
        let out_path = dest_dir.join(relative);

        let written = if entry.is_dir() {
            fs::create_dir_all(&out_path)
        } else {
            write_entry(&mut entry, &out_path)
        };
        match written {
            Ok(()) if entry.is_dir() => {}
            Ok(()) => report.extracted += 1,
            Err(e) => {
                tracing::warn!(target: "download::extract", "Could not extract {}: {}", name, e);
                report.skipped.push(name);
            }
        }
    }
    Ok(report)
}

fn write_entry(entry: &mut zip::read::ZipFile<'_>, out_path: &Path) -> io::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(out_path)?;
    io::copy(entry, &mut out)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(out_path, fs::Permissions::from_mode(mode & 0o777 | 0o600))?;
        }
    }
    Ok(())
}
