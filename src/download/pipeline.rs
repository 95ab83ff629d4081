// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One job, end to end.
//!
//! ```text
//!  admit(url) ──follower──▶ wait for leader ──▶ shared (success, message)
//!      │ leader
//!      ▼
//!  ledger: Downloading
//!      │
//!      ├── spawned task: resolve ─▶ presence ─▶ transfer ─▶ extract
//!      │        │ JobEvent (mpsc)
//!      ▼        ▼
//!  aggregator: fold into watch view, persist progress to the ledger
//!      │ task joined, channel drained
//!      ▼
//!  ledger: terminal status ─▶ ownership ─▶ release url
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::dedup::{Admission, Follower, InFlightRegistry};
use super::events::{fold, EventSink, JobEvent};
use super::extract::{ArchiveKind, PostProcessor};
use super::http::BROWSER_USER_AGENT;
use super::ledger::JobLedger;
use super::outcome::{FatalKind, JobOutcome};
use super::persist::off_runtime;
use super::ownership::OwnershipLedger;
use super::paths::{destination_dir, requires_extraction, target_filename};
use super::presence::{check_existing, Presence, RemoteSize};
use super::resolver::{LinkResolver, ResolveError, ResolveRequest};
use super::transfer::{TransferEngine, TransferError};
use super::types::{Job, JobProgress, JobStatus};
use crate::config::Settings;

/// Progress is written to the ledger at least this often.
const PERSIST_INTERVAL: Duration = Duration::from_secs(2);
/// ...and whenever the percentage crosses a multiple of this.
const PERSIST_STEP: u8 = 5;

/// What the job task hands back to the aggregator.
#[derive(Debug)]
struct Finished {
    outcome: JobOutcome,
    /// Size recorded in the ownership ledger.
    size: Option<u64>,
}

impl Finished {
    fn new(outcome: JobOutcome, size: Option<u64>) -> Self {
        Self { outcome, size }
    }

    fn failed(outcome: JobOutcome) -> Self {
        Self { outcome, size: None }
    }
}

impl From<TransferError> for JobOutcome {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Canceled => JobOutcome::Canceled,
            TransferError::Transient { kind, message } => JobOutcome::transient(kind, message),
            TransferError::Rejected { message, .. } => JobOutcome::fatal(FatalKind::Http, message),
            err @ TransferError::Request(_) => JobOutcome::fatal(FatalKind::Http, err.to_string()),
            err @ TransferError::Io { .. } => JobOutcome::fatal(FatalKind::LocalIo, err.to_string()),
        }
    }
}

impl From<ResolveError> for JobOutcome {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Canceled => JobOutcome::Canceled,
            other => JobOutcome::fatal(FatalKind::Resolution, other.to_string()),
        }
    }
}

/// The part of a job that runs on its own task. Cheap to clone.
#[derive(Debug, Clone)]
struct Stages {
    settings: Arc<Settings>,
    client: Client,
    resolver: LinkResolver,
    transfer: TransferEngine,
    post: PostProcessor,
}

impl Stages {
    async fn execute(&self, job: &Job, cancel: &CancellationToken, events: &EventSink) -> Finished {
        let credentials = self.settings.current_credentials();
        let request = ResolveRequest {
            source_url: &job.source_url,
            display_name: &job.display_name,
            credentials: &credentials,
        };
        let resolved = match self.resolver.resolve(request, cancel, events).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(target: "download::pipeline", "Resolution failed for {}: {}", job.source_url, e);
                return Finished::failed(e.into());
            }
        };
        events.emit(JobEvent::Provider(resolved.provider));
        tracing::debug!(
            target: "download::pipeline",
            "{} resolved via {} to {}",
            job.display_name, resolved.provider, resolved.url
        );

        let dir = destination_dir(&self.settings, &job.platform);
        let dest = dir.join(target_filename(&job.display_name, resolved.filename.as_deref(), &job.source_url));
        if cancel.is_cancelled() {
            return Finished::failed(JobOutcome::Canceled);
        }

        let mut remote = RemoteSize::new(
            &self.client,
            &resolved.url,
            resolved.size,
            self.settings.resolver.request_timeout(),
        );
        match check_existing(&dest, &mut remote).await {
            Ok(Presence::Absent) => {}
            Ok(Presence::Present(path)) => {
                tracing::info!(target: "download::pipeline", "{:?} already present, skipping", path);
                return Finished::new(
                    JobOutcome::already_present(format!("{}: already present", job.display_name)),
                    file_size(&path).await,
                );
            }
            Ok(Presence::Extracted(path)) => {
                tracing::info!(target: "download::pipeline", "{:?} already extracted, skipping", path);
                return Finished::new(
                    JobOutcome::already_present(format!("{}: already extracted", job.display_name)),
                    file_size(&path).await,
                );
            }
            Err(e) => return Finished::failed(JobOutcome::fatal(FatalKind::LocalIo, format!("{:#}", e))),
        }

        let report = match self.transfer.fetch(&resolved.url, &dest, cancel, events).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(target: "download::pipeline", "Transfer of {} failed: {}", job.display_name, e);
                return Finished::failed(e.into());
            }
        };
        let size = Some(report.bytes);

        let must_extract = job.force_extract || requires_extraction(&self.settings, &job.platform);
        if !must_extract || ArchiveKind::detect(&report.path).is_none() {
            return Finished::new(JobOutcome::success(format!("{} downloaded", job.display_name)), size);
        }

        events.emit(JobEvent::Extracting);
        match self.post.extract(&report.path, &dir).await {
            Ok(extracted) if extracted.is_partial() => Finished::new(
                JobOutcome::success(format!("{} downloaded; {}", job.display_name, extracted.summary())),
                size,
            ),
            Ok(_) => Finished::new(
                JobOutcome::success(format!("{} downloaded and extracted", job.display_name)),
                size,
            ),
            Err(e) => Finished::failed(JobOutcome::fatal(FatalKind::Extraction, format!("Extraction failed: {}", e))),
        }
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// When the aggregator last wrote progress to the ledger.
struct PersistMark {
    at: Instant,
    bucket: u8,
}

impl PersistMark {
    fn due(&self, view: &JobProgress, structural: bool) -> bool {
        structural || view.progress_percent / PERSIST_STEP != self.bucket || self.at.elapsed() >= PERSIST_INTERVAL
    }

    fn reset(&mut self, view: &JobProgress) {
        self.at = Instant::now();
        self.bucket = view.progress_percent / PERSIST_STEP;
    }
}

/// Runs jobs against the shared stores.
#[derive(Debug, Clone)]
pub struct JobRunner {
    stages: Stages,
    ledger: JobLedger,
    ownership: OwnershipLedger,
    flights: InFlightRegistry,
}

impl JobRunner {
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(Duration::from_secs(settings.transfer.connect_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let transfer = TransferEngine::new(settings.transfer.clone()).context("Failed to build transfer client")?;

        Ok(Self {
            ledger: JobLedger::new(settings.ledger_path()),
            ownership: OwnershipLedger::new(settings.ownership_path()),
            flights: InFlightRegistry::new(settings.duplicate_wait()),
            stages: Stages {
                resolver: LinkResolver::new(client.clone(), settings.clone()),
                client,
                transfer,
                post: PostProcessor::new(),
                settings,
            },
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.stages.settings
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn ownership(&self) -> &OwnershipLedger {
        &self.ownership
    }

    pub fn flights(&self) -> &InFlightRegistry {
        &self.flights
    }

    /// Run `job` to a terminal outcome, publishing its live view on `progress`.
    ///
    /// A URL already being downloaded is not fetched twice: the second caller
    /// waits for the first and reports the same `(success, message)`.
    pub async fn run(
        &self,
        job: &Job,
        cancel: CancellationToken,
        progress: &watch::Sender<JobProgress>,
    ) -> JobOutcome {
        self.run_with_hook(job, cancel, progress, || {}).await
    }

    /// Like [`run`](Self::run); `on_follow` fires as soon as the job turns out
    /// to be a duplicate waiting on another one.
    pub async fn run_with_hook(
        &self,
        job: &Job,
        cancel: CancellationToken,
        progress: &watch::Sender<JobProgress>,
        on_follow: impl FnOnce(),
    ) -> JobOutcome {
        let guard = match self.flights.admit(&job.source_url) {
            Admission::Leader(guard) => guard,
            Admission::Follower(follower) => {
                on_follow();
                return self.follow(job, follower, &cancel, progress).await;
            }
        };

        let outcome = self.lead(job, cancel, progress).await;
        guard.complete(outcome.summary());
        outcome
    }

    async fn follow(
        &self,
        job: &Job,
        follower: Follower,
        cancel: &CancellationToken,
        progress: &watch::Sender<JobProgress>,
    ) -> JobOutcome {
        tracing::info!(
            target: "download::pipeline",
            "{} is already downloading, waiting for it", job.source_url
        );
        progress.send_modify(|view| {
            view.status = JobStatus::Downloading;
            view.message = "Waiting for identical download".to_string();
        });

        // The leader keeps going; only this requester stops waiting
        let outcome = tokio::select! {
            _ = cancel.cancelled() => JobOutcome::Canceled,
            shared = follower.wait() => JobOutcome::from_shared(shared),
        };
        progress.send_modify(|view| {
            view.status = outcome.status();
            view.message = outcome.message().to_string();
            view.speed = 0.0;
            if outcome.is_success() {
                view.progress_percent = 100;
            }
        });
        outcome
    }

    async fn lead(&self, job: &Job, cancel: CancellationToken, progress: &watch::Sender<JobProgress>) -> JobOutcome {
        tracing::info!(target: "download::pipeline", "Starting {} ({})", job.display_name, job.source_url);
        let (ledger, started) = (self.ledger.clone(), job.clone());
        if let Err(e) = off_runtime(move || ledger.start(&started)).await {
            tracing::error!(target: "download::pipeline", "Failed to record start of {}: {:#}", job.source_url, e);
        }

        let mut view = progress.borrow().clone();
        view.status = JobStatus::Downloading;
        view.message = format!("Downloading {}", job.display_name);
        progress.send_replace(view.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stages = self.stages.clone();
        let task_job = job.clone();
        let mut task = tokio::spawn(async move {
            let events = EventSink::new(tx);
            stages.execute(&task_job, &cancel, &events).await
        });

        let mut mark = PersistMark { at: Instant::now(), bucket: 0 };
        let joined = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.absorb(&mut view, &event, progress, &mut mark).await,
                joined = &mut task => break joined,
            }
        };
        // Events sent just before the task returned
        while let Ok(event) = rx.try_recv() {
            self.absorb(&mut view, &event, progress, &mut mark).await;
        }

        let finished = joined.unwrap_or_else(|e| {
            tracing::error!(target: "download::pipeline", "Job task for {} crashed: {}", job.source_url, e);
            Finished::failed(JobOutcome::fatal(FatalKind::Internal, format!("Job task failed: {}", e)))
        });
        let outcome = finished.outcome;

        view.status = outcome.status();
        view.message = outcome.message().to_string();
        view.speed = 0.0;
        if outcome.is_success() {
            view.progress_percent = 100;
        }

        let (ledger, url, recorded, provider) = (self.ledger.clone(), job.source_url.clone(), outcome.clone(), view.provider);
        if let Err(e) = off_runtime(move || ledger.finish(&url, &recorded, provider)).await {
            tracing::error!(target: "download::pipeline", "Failed to record outcome of {}: {:#}", job.source_url, e);
        }
        if outcome.is_success() {
            let ownership = self.ownership.clone();
            let (platform, game, size) = (job.platform.clone(), job.display_name.clone(), finished.size);
            if let Err(e) = off_runtime(move || ownership.mark_owned(&platform, &game, size)).await {
                tracing::error!(target: "download::pipeline", "Failed to record ownership of {}: {:#}", job.display_name, e);
            }
        }
        progress.send_replace(view);

        tracing::info!(target: "download::pipeline", "{}: {}", job.display_name, outcome);
        outcome
    }

    async fn absorb(
        &self,
        view: &mut JobProgress,
        event: &JobEvent,
        progress: &watch::Sender<JobProgress>,
        mark: &mut PersistMark,
    ) {
        let structural = fold(view, event);
        progress.send_replace(view.clone());
        if mark.due(view, structural) {
            let (ledger, snapshot) = (self.ledger.clone(), view.clone());
            if let Err(e) = off_runtime(move || ledger.apply_progress(&snapshot)).await {
                tracing::error!(target: "download::pipeline", "Failed to persist progress: {:#}", e);
            }
            mark.reset(view);
        }
    }
}
