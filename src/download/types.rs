// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job types shared by the queue, the ledger and the HTTP API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic identifier assigned at enqueue time.
pub type TaskId = u64;

/// Lifecycle status of a job, as written to the ledger.
///
/// `Queued -> Downloading -> {Extracting} -> {Download_OK | Failed | Canceled}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    #[serde(alias = "Téléchargement", alias = "downloading")]
    Downloading,
    #[serde(alias = "Converting")]
    Extracting,
    #[serde(rename = "Download_OK", alias = "Completed")]
    DownloadOk,
    #[serde(alias = "Erreur", alias = "Error")]
    Failed,
    Canceled,
}

impl JobStatus {
    /// Returns true once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::DownloadOk | JobStatus::Failed | JobStatus::Canceled)
    }

    /// Returns true while the owning job task is running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Extracting)
    }

    /// Wire name, as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Downloading => "Downloading",
            JobStatus::Extracting => "Extracting",
            JobStatus::DownloadOk => "Download_OK",
            JobStatus::Failed => "Failed",
            JobStatus::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which resolver produced the final link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    /// Authenticated locker API.
    #[serde(rename = "1F")]
    OneFichier,
    /// Unlock service A.
    #[serde(rename = "AD")]
    AllDebrid,
    /// Unlock service B.
    #[serde(rename = "RD")]
    RealDebrid,
    /// Anonymous scrape of the locker landing page.
    #[serde(rename = "FREE")]
    Free,
    /// Plain HTTP host, no resolution needed.
    #[serde(rename = "DIRECT")]
    Direct,
}

impl Provider {
    /// Short tag used as a message prefix and in the ledger.
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::OneFichier => "1F",
            Provider::AllDebrid => "AD",
            Provider::RealDebrid => "RD",
            Provider::Free => "FREE",
            Provider::Direct => "DIRECT",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One requested transfer. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub task_id: TaskId,
    pub source_url: String,
    pub platform: String,
    pub display_name: String,
    /// Caller says the payload is not playable as shipped.
    #[serde(default)]
    pub force_extract: bool,
}

impl Job {
    pub fn new(
        task_id: TaskId,
        source_url: impl Into<String>,
        platform: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            source_url: source_url.into(),
            platform: platform.into(),
            display_name: display_name.into(),
            force_extract: false,
        }
    }

    pub fn with_force_extract(mut self, force: bool) -> Self {
        self.force_extract = force;
        self
    }
}

/// Live view of one job, published through its watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub task_id: TaskId,
    pub source_url: String,
    pub display_name: String,
    pub platform: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// MB/s
    pub speed: f64,
    pub message: String,
    pub provider: Option<Provider>,
}

impl JobProgress {
    /// Initial view of a freshly queued job.
    pub fn queued(job: &Job) -> Self {
        Self {
            task_id: job.task_id,
            source_url: job.source_url.clone(),
            display_name: job.display_name.clone(),
            platform: job.platform.clone(),
            status: JobStatus::Queued,
            progress_percent: 0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: 0.0,
            message: "Queued".to_string(),
            provider: None,
        }
    }

    /// Row for the status query.
    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id,
            game_name: self.display_name.clone(),
            platform: self.platform.clone(),
            status: self.status,
            progress: self.progress_percent,
            speed: self.speed,
        }
    }

    /// Human-readable speed.
    pub fn speed_string(&self) -> String {
        if self.speed >= 1.0 {
            format!("{:.1} MB/s", self.speed)
        } else {
            format!("{:.0} KB/s", self.speed * 1024.0)
        }
    }
}

/// One row of the status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    pub task_id: TaskId,
    pub game_name: String,
    pub platform: String,
    pub status: JobStatus,
    pub progress: u8,
    pub speed: f64,
}

/// Integer percent of `downloaded` over `total`, clamped to `0..=100`.
///
/// Unknown or zero totals report 0.
pub fn percent(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = (downloaded as u128 * 100) / total as u128;
            pct.min(100) as u8
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&JobStatus::DownloadOk).unwrap(), "\"Download_OK\"");
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"Queued\"");
        let legacy: JobStatus = serde_json::from_str("\"Erreur\"").unwrap();
        assert_eq!(legacy, JobStatus::Failed);
        let legacy: JobStatus = serde_json::from_str("\"Téléchargement\"").unwrap();
        assert_eq!(legacy, JobStatus::Downloading);
    }

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Downloading.is_active());
        assert!(JobStatus::Extracting.is_active());
        assert!(!JobStatus::Queued.is_active());
        assert!(!JobStatus::Queued.is_terminal());
        for status in [JobStatus::DownloadOk, JobStatus::Failed, JobStatus::Canceled] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
    }

    #[test]
    fn test_percent_clamps() {
        assert_eq!(percent(0, None), 0);
        assert_eq!(percent(500, None), 0);
        assert_eq!(percent(10, Some(0)), 0);
        assert_eq!(percent(50, Some(200)), 25);
        assert_eq!(percent(200, Some(200)), 100);
        // Server lied about the length
        assert_eq!(percent(300, Some(200)), 100);
        assert_eq!(percent(u64::MAX, Some(u64::MAX)), 100);
    }

    #[test]
    fn test_provider_tags() {
        assert_eq!(serde_json::to_string(&Provider::OneFichier).unwrap(), "\"1F\"");
        assert_eq!(Provider::RealDebrid.tag(), "RD");
    }

    #[test]
    fn test_view_from_progress() {
        let job = Job::new(4, "https://host/a.zip", "SNES", "Foo");
        let view = JobProgress::queued(&job).view();
        assert_eq!(view.task_id, 4);
        assert_eq!(view.game_name, "Foo");
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.progress, 0);
    }
}
