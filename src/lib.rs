// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! romfetch - multi-provider ROM download orchestrator
//!
//! Locker links in, verified files out.
//!
//! A job enters through [`download::DownloadManager::enqueue`], waits in a FIFO
//! backlog, and is admitted one at a time. Each admitted job resolves its
//! source link through the provider chain, streams the payload to disk, and
//! optionally extracts it:
//!
//! **Backlog** -> **Dedup** -> **Resolver** -> **Transfer** -> **Post-Processor**
//!
//! # Core Modules
//!
//! - [`download`] - Queue worker, job ledger, resolver chain, transfer engine
//! - [`config`] - Settings file, credentials, and environment overrides
//! - [`server`] - HTTP API for enqueueing and polling jobs
//! - [`errors`] - API error responses with reference codes
//! - [`logging`] - tracing subscriber setup

// A panicking job task must unwind so its in-flight slot and busy flag are released
#[cfg(panic = "abort")]
compile_error!("romfetch requires panic = \"unwind\"");

pub mod config;
pub mod download;
pub mod errors;
pub mod logging;
pub mod server;
pub mod sync;

pub use config::Settings;
pub use download::{DownloadHandle, DownloadManager, Job, JobOutcome, JobStatus};
pub use server::Server;
