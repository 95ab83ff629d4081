// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock-file guarded, atomically replaced JSON files.
//!
//! Both ledgers persist through here. Writers take an exclusive lock on a
//! sibling `.lock` file, write `<name>.tmp`, fsync it and rename it over the
//! target, so a reader never sees a truncated document and a crash mid-write
//! leaves the previous version intact.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// Default timeout for acquiring file locks.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file guarding `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock on `path`, polling until `timeout`.
///
/// The lock lives as long as the returned handle.
pub fn acquire_exclusive(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match fs2::FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another romfetch instance may be writing the ledger.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock on `path`, polling until `timeout`.
pub fn acquire_shared(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match fs2::FileExt::try_lock_shared(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock on {:?} after {:?}.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to acquire shared lock on {:?}", path));
            }
        }
    }
}

/// Run a store operation on the blocking pool.
///
/// Lock polling and fsync stay off the async workers.
pub async fn off_runtime<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("Store task failed")?
}

/// Read `path` to a string; `None` when it does not exist.
///
/// Caller holds the lock.
pub fn read_unlocked(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
    }
}

/// Replace `path` with `content` via temp file + rename.
///
/// Caller holds the exclusive lock.
pub fn write_atomic_unlocked(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        temp_file
            .write_all(content)
            .with_context(|| "Failed to write to temp file")?;

        // Data must be on disk before the rename makes it visible
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync temp file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file: {:?} -> {:?}", temp_path, path))?;

    Ok(())
}
