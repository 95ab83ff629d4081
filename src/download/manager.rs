// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: FIFO backlog plus a worker that admits one job at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelRegistry;
use super::ledger::LedgerEntry;
use super::ownership::OwnershipMap;
use super::pipeline::JobRunner;
use super::types::{Job, JobProgress, JobStatus, TaskId, TaskView};
use crate::config::Settings;
use crate::sync::{resilient_lock, resilient_read, resilient_write};

/// Handle to one enqueued job, for progress checks.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub task_id: TaskId,
    progress_rx: watch::Receiver<JobProgress>,
}

impl DownloadHandle {
    /// Current live view.
    pub fn progress(&self) -> JobProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.progress_rx.borrow().status.is_terminal()
    }

    /// Wait for the next change. Returns false once the job is gone.
    pub async fn changed(&mut self) -> bool {
        self.progress_rx.changed().await.is_ok()
    }

    /// Wait for the job to reach a terminal status.
    pub async fn wait(&mut self) -> JobProgress {
        loop {
            if self.progress_rx.borrow().status.is_terminal() {
                return self.progress_rx.borrow().clone();
            }
            if self.progress_rx.changed().await.is_err() {
                // Sender dropped
                return self.progress_rx.borrow().clone();
            }
        }
    }
}

/// A job waiting in the backlog.
struct Pending {
    job: Job,
    progress: watch::Sender<JobProgress>,
}

impl Pending {
    /// Publish a terminal `Canceled` view before the sender goes away.
    fn cancel(self) -> Job {
        self.progress.send_modify(|view| {
            view.status = JobStatus::Canceled;
            view.message = "Download canceled".to_string();
        });
        self.job
    }
}

struct Shared {
    runner: JobRunner,
    backlog: Mutex<VecDeque<Pending>>,
    /// Live views of admitted jobs.
    active: RwLock<HashMap<TaskId, watch::Receiver<JobProgress>>>,
    cancels: CancelRegistry,
    next_id: AtomicU64,
    busy: AtomicBool,
    wake: Notify,
}

/// Clears the busy flag and pokes the worker when dropped.
struct BusyGuard(Arc<Shared>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
        self.0.wake.notify_one();
    }
}

impl Shared {
    /// Start the backlog head if nothing is running.
    fn admit_next(self: &Arc<Self>) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let busy = BusyGuard(self.clone());

        let Some(Pending { job, progress }) = resilient_lock(&self.backlog).pop_front() else {
            return;
        };
        let cancel = self.cancels.register(job.task_id);
        resilient_write(&self.active).insert(job.task_id, progress.subscribe());
        tracing::info!(target: "download::queue", "Admitting task {} ({})", job.task_id, job.display_name);

        let shared = self.clone();
        tokio::spawn(async move {
            // A duplicate waits on its leader without holding the worker
            let release = move || drop(busy);
            shared.runner.run_with_hook(&job, cancel, &progress, release).await;

            shared.cancels.remove(job.task_id);
            resilient_write(&shared.active).remove(&job.task_id);
        });
    }

    fn take_from_backlog(&self, task_id: TaskId) -> Option<Pending> {
        let mut backlog = resilient_lock(&self.backlog);
        let index = backlog.iter().position(|p| p.job.task_id == task_id)?;
        backlog.remove(index)
    }

    /// Ledger bookkeeping for a job pulled out of the backlog.
    fn drop_queued(&self, pending: Pending) {
        let task_id = pending.job.task_id;
        let job = pending.cancel();
        self.cancels.remove(task_id);
        let still_wanted = resilient_lock(&self.backlog)
            .iter()
            .any(|p| p.job.source_url == job.source_url);
        if !still_wanted {
            if let Err(e) = self.runner.ledger().cancel_queued(&job.source_url) {
                tracing::error!(target: "download::queue", "Failed to record cancel: {:#}", e);
            }
        }
    }
}

/// Queue front-end. Owns the worker task.
pub struct DownloadManager {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Build the stores and start the queue worker. Needs a tokio runtime.
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        let poll = settings.queue_poll_interval();
        let shared = Arc::new(Shared {
            runner: JobRunner::new(settings)?,
            backlog: Mutex::new(VecDeque::new()),
            active: RwLock::new(HashMap::new()),
            cancels: CancelRegistry::new(),
            next_id: AtomicU64::new(1),
            busy: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        let worker_shared = shared.clone();
        let worker_shutdown = shutdown.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_shutdown.cancelled() => break,
                    _ = worker_shared.wake.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
                worker_shared.admit_next();
            }
            tracing::debug!(target: "download::queue", "Queue worker stopped");
        });

        Ok(Self {
            shared,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn runner(&self) -> &JobRunner {
        &self.shared.runner
    }

    /// Append a job to the backlog.
    pub fn enqueue(
        &self,
        url: &str,
        game_name: &str,
        platform: &str,
        force_extract: bool,
    ) -> Result<DownloadHandle> {
        let url = url.trim();
        if url.is_empty() || game_name.trim().is_empty() || platform.trim().is_empty() {
            bail!("url, game_name and platform are required");
        }

        let task_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(task_id, url, platform.trim(), game_name.trim()).with_force_extract(force_extract);
        self.shared.cancels.register(task_id);

        if let Err(e) = self.shared.runner.ledger().enqueue(&job) {
            tracing::error!(target: "download::queue", "Failed to record queued job: {:#}", e);
        }

        let (progress, progress_rx) = watch::channel(JobProgress::queued(&job));
        tracing::info!(target: "download::queue", "Queued task {}: {} ({})", task_id, job.display_name, job.platform);
        resilient_lock(&self.shared.backlog).push_back(Pending { job, progress });
        self.shared.wake.notify_one();

        Ok(DownloadHandle { task_id, progress_rx })
    }

    /// Running jobs first, then the backlog in FIFO order.
    pub fn status(&self) -> Vec<TaskView> {
        let mut active: Vec<TaskView> = resilient_read(&self.shared.active)
            .values()
            .map(|rx| rx.borrow().view())
            .collect();
        active.sort_by_key(|view| view.task_id);

        let backlog = resilient_lock(&self.shared.backlog);
        active.extend(backlog.iter().map(|p| p.progress.borrow().view()));
        active
    }

    pub fn active_count(&self) -> usize {
        resilient_read(&self.shared.active).len()
    }

    pub fn queued_count(&self) -> usize {
        resilient_lock(&self.shared.backlog).len()
    }

    /// Set the task's token and drop it from the backlog.
    ///
    /// Returns whether a token existed for `task_id`.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let found = self.shared.cancels.cancel(task_id);
        if let Some(pending) = self.shared.take_from_backlog(task_id) {
            self.shared.drop_queued(pending);
        }
        tracing::info!(target: "download::queue", "Cancel task {}: {}", task_id, if found { "signaled" } else { "unknown" });
        found
    }

    /// Cancel everything: running jobs, the backlog, and `Queued` ledger entries.
    ///
    /// The busy flag is left to the running job's own completion.
    pub fn cancel_all(&self) -> usize {
        let signaled = self.shared.cancels.cancel_all();
        let drained: Vec<Pending> = resilient_lock(&self.shared.backlog).drain(..).collect();
        for pending in drained {
            self.shared.cancels.remove(pending.job.task_id);
            pending.cancel();
        }
        match self.shared.runner.ledger().cancel_all_queued() {
            Ok(count) => tracing::info!(target: "download::queue", "Canceled {} tasks ({} queued entries)", signaled, count),
            Err(e) => tracing::error!(target: "download::queue", "Failed to cancel queued entries: {:#}", e),
        }
        signaled
    }

    pub fn history(&self) -> Result<Vec<LedgerEntry>> {
        self.shared.runner.ledger().load()
    }

    /// Drop finished entries; queued and running ones stay.
    pub fn clear_history(&self) -> Result<usize> {
        self.shared.runner.ledger().clear()
    }

    pub fn owned(&self) -> Result<OwnershipMap> {
        self.shared.runner.ownership().load()
    }

    /// Stop the worker and cancel running jobs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.shared.cancels.cancel_all();
        let worker = resilient_lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(target: "download::queue", "Queue worker ended abnormally: {}", e);
            }
        }
    }
}
