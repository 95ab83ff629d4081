// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress events flowing from a job task to its aggregator.

use tokio::sync::mpsc;

use super::types::{percent, JobProgress, JobStatus, Provider};

/// One sampled transfer position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    /// MB/s over the last sample window.
    pub speed: f64,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        percent(self.downloaded, self.total)
    }
}

/// Something worth telling the ledger about.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Free-form status line ("Try 2/4", "Resolving link", ...).
    Message(String),
    /// The resolver settled on a provider.
    Provider(Provider),
    /// Countdown imposed by the host.
    Waiting { remaining: u64, total: u64 },
    /// Transfer started (or restarted from zero).
    Started { total: Option<u64> },
    Progress(TransferProgress),
    /// Post-processing began.
    Extracting,
}

/// Sending half handed to resolvers, the transfer engine and the extractor.
///
/// Sends never fail the caller: once the aggregator is gone events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn message(&self, message: impl Into<String>) {
        self.emit(JobEvent::Message(message.into()));
    }
}

/// Apply `event` to the live view.
///
/// Returns true when the change is structural (status, provider, message)
/// rather than a plain byte-count update.
pub fn fold(view: &mut JobProgress, event: &JobEvent) -> bool {
    match event {
        JobEvent::Message(message) => {
            let changed = view.message != *message;
            view.message = message.clone();
            changed
        }
        JobEvent::Provider(provider) => {
            let changed = view.provider != Some(*provider);
            view.provider = Some(*provider);
            changed
        }
        JobEvent::Waiting { remaining, total } => {
            view.message = format!("Waiting {}s / {}s", remaining, total);
            true
        }
        JobEvent::Started { total } => {
            view.status = JobStatus::Downloading;
            view.downloaded_bytes = 0;
            view.progress_percent = 0;
            view.total_bytes = *total;
            view.speed = 0.0;
            true
        }
        JobEvent::Progress(progress) => {
            view.downloaded_bytes = progress.downloaded;
            view.total_bytes = progress.total.or(view.total_bytes);
            view.progress_percent = progress.percent();
            view.speed = progress.speed;
            false
        }
        JobEvent::Extracting => {
            view.status = JobStatus::Extracting;
            view.speed = 0.0;
            view.message = format!("Extracting {}", view.display_name);
            true
        }
    }
}
