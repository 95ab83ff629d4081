// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted job ledger.
//!
//! One entry per distinct source URL, stored as a human-readable JSON list
//! that presentation layers poll for progress. Every mutation is a
//! read-modify-write under the ledger's exclusive lock file, finished with an
//! atomic replace.
//!
//! Write ownership: only the job task currently owning a URL (as granted by
//! the in-flight registry) writes that URL's active entry. Terminal entries
//! are never touched by progress or completion updates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::outcome::JobOutcome;
use super::persist::{self, LOCK_TIMEOUT};
use super::types::{Job, JobProgress, JobStatus, Provider, TaskId};

/// One ledger record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub platform: String,
    #[serde(alias = "game_name")]
    pub display_name: String,
    #[serde(alias = "url")]
    pub source_url: String,
    pub status: JobStatus,
    #[serde(default, alias = "progress", deserialize_with = "lenient_percent")]
    pub progress_percent: u8,
    #[serde(default, alias = "downloaded_size")]
    pub downloaded_bytes: u64,
    #[serde(default, alias = "total_size")]
    pub total_bytes: Option<u64>,
    /// MB/s
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    fn for_job(job: &Job, status: JobStatus, message: String) -> Self {
        Self {
            platform: job.platform.clone(),
            display_name: job.display_name.clone(),
            source_url: job.source_url.clone(),
            status,
            progress_percent: 0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: 0.0,
            message,
            provider: None,
            task_id: Some(job.task_id),
            timestamp: Utc::now(),
        }
    }
}

/// Accepts integer or float percentages.
fn lenient_percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let value = f64::deserialize(deserializer)?;
    Ok(value.clamp(0.0, 100.0) as u8)
}

/// Accepts RFC 3339 and the older `%Y-%m-%d %H:%M:%S` local format.
fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Store object for the ledger file.
#[derive(Debug, Clone)]
pub struct JobLedger {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JobLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        persist::lock_path_for(&self.path)
    }

    /// Parse the document, skipping malformed entries.
    fn parse(&self, content: &str) -> Result<Vec<LedgerEntry>> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<serde_json::Value> = serde_json::from_str(content)
            .with_context(|| format!("Failed to parse ledger file: {:?}", self.path))?;

        let mut entries = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<LedgerEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    target: "download::ledger",
                    "Skipping malformed ledger entry #{}: {}",
                    index,
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn read_unlocked(&self) -> Result<Vec<LedgerEntry>> {
        match persist::read_unlocked(&self.path)? {
            Some(content) => self.parse(&content),
            None => Ok(Vec::new()),
        }
    }

    fn write_unlocked(&self, entries: &[LedgerEntry]) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)
            .with_context(|| "Failed to serialize ledger to JSON")?;
        persist::write_atomic_unlocked(&self.path, content.as_bytes())
    }

    /// Load all entries. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<LedgerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = persist::acquire_shared(&self.lock_path(), self.lock_timeout)?;
        self.read_unlocked()
    }

    /// Replace the whole ledger.
    pub fn save(&self, entries: &[LedgerEntry]) -> Result<()> {
        let _lock = persist::acquire_exclusive(&self.lock_path(), self.lock_timeout)?;
        self.write_unlocked(entries)
    }

    /// Read-modify-write under the exclusive lock.
    ///
    /// The file is rewritten only when `f` reports a change.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Vec<LedgerEntry>) -> (bool, R)) -> Result<R> {
        let _lock = persist::acquire_exclusive(&self.lock_path(), self.lock_timeout)?;
        let mut entries = self.read_unlocked()?;
        let (changed, result) = f(&mut entries);
        if changed {
            self.write_unlocked(&entries)?;
        }
        Ok(result)
    }

    /// Entry for `url`, if any.
    pub fn entry(&self, url: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.load()?.into_iter().find(|e| e.source_url == url))
    }

    /// Record a freshly enqueued job as `Queued`.
    ///
    /// An entry whose job is still running is left alone and `false` returned.
    pub fn enqueue(&self, job: &Job) -> Result<bool> {
        self.modify(|entries| {
            let fresh = LedgerEntry::for_job(job, JobStatus::Queued, "Queued".to_string());
            match entries.iter_mut().find(|e| e.source_url == job.source_url) {
                Some(existing) if existing.status.is_active() => (false, false),
                Some(existing) => {
                    *existing = fresh;
                    (true, true)
                }
                None => {
                    entries.push(fresh);
                    (true, true)
                }
            }
        })
    }

    /// Move the job's entry to `Downloading`, creating it if needed.
    pub fn start(&self, job: &Job) -> Result<()> {
        self.modify(|entries| {
            let fresh = LedgerEntry::for_job(
                job,
                JobStatus::Downloading,
                format!("Downloading {}", job.display_name),
            );
            match entries.iter_mut().find(|e| e.source_url == job.source_url) {
                Some(existing) => *existing = fresh,
                None => entries.push(fresh),
            }
            (true, ())
        })
    }

    /// Fold a live progress view into the job's active entry.
    pub fn apply_progress(&self, view: &JobProgress) -> Result<bool> {
        self.modify(|entries| {
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.source_url == view.source_url && e.status.is_active())
            else {
                return (false, false);
            };
            entry.status = view.status;
            entry.progress_percent = view.progress_percent;
            entry.downloaded_bytes = view.downloaded_bytes;
            entry.total_bytes = view.total_bytes;
            entry.speed = view.speed;
            entry.message = view.message.clone();
            entry.provider = view.provider.or(entry.provider);
            entry.timestamp = Utc::now();
            (true, true)
        })
    }

    /// Write the terminal status for `url`. Only an active entry is updated.
    pub fn finish(&self, url: &str, outcome: &JobOutcome, provider: Option<Provider>) -> Result<bool> {
        self.modify(|entries| {
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.source_url == url && e.status.is_active())
            else {
                return (false, false);
            };
            entry.status = outcome.status();
            entry.message = outcome.message().to_string();
            entry.speed = 0.0;
            if outcome.is_success() {
                entry.progress_percent = 100;
            }
            entry.provider = provider.or(entry.provider);
            entry.timestamp = Utc::now();
            (true, true)
        })
    }

    /// Mark a still-queued entry as canceled.
    pub fn cancel_queued(&self, url: &str) -> Result<bool> {
        self.modify(|entries| {
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.source_url == url && e.status == JobStatus::Queued)
            else {
                return (false, false);
            };
            entry.status = JobStatus::Canceled;
            entry.message = "Download canceled".to_string();
            entry.timestamp = Utc::now();
            (true, true)
        })
    }

    /// Rewrite every `Queued` entry to `Canceled`. Returns how many changed.
    pub fn cancel_all_queued(&self) -> Result<usize> {
        self.modify(|entries| {
            let now = Utc::now();
            let mut count = 0;
            for entry in entries.iter_mut().filter(|e| e.status == JobStatus::Queued) {
                entry.status = JobStatus::Canceled;
                entry.message = "Download canceled".to_string();
                entry.timestamp = now;
                count += 1;
            }
            (count > 0, count)
        })
    }

    /// Drop every entry except queued and running ones. Returns how many went.
    pub fn clear(&self) -> Result<usize> {
        self.modify(|entries| {
            let before = entries.len();
            entries.retain(|e| e.status.is_active() || e.status == JobStatus::Queued);
            let removed = before - entries.len();
            (removed > 0, removed)
        })
    }

    /// Count of entries per status.
    pub fn status_counts(&self) -> Result<Vec<(JobStatus, usize)>> {
        let entries = self.load()?;
        let order = [
            JobStatus::Queued,
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::DownloadOk,
            JobStatus::Failed,
            JobStatus::Canceled,
        ];
        Ok(order
            .into_iter()
            .map(|status| (status, entries.iter().filter(|e| e.status == status).count()))
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}
