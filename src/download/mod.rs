// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration for romfetch
//!
//! This module turns a `(url, game, platform)` request into a verified file
//! under the ROM library:
//! - FIFO backlog, one job admitted at a time
//! - Provider chain: 1fichier API, AllDebrid, RealDebrid, free-mode scrape
//! - Resumable streaming with a header-profile ladder on 401/403
//! - Archive extraction for platforms that need it
//! - A JSON job ledger and an ownership index that survive restarts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Queue worker    │
//! │ (backlog)       │     │ (tokio)         │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │ admit
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ JobLedger       │◀────│ JobRunner       │
//! │ (persistent)    │     │ resolve/fetch   │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use romfetch::{DownloadManager, Settings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(Arc::new(Settings::load(None)?))?;
//!
//! let mut handle = manager.enqueue("https://1fichier.com/?abc123", "Foo", "SNES", false)?;
//! println!("Status: {}", handle.progress().status);
//!
//! let done = handle.wait().await;
//! println!("{}: {}", done.status, done.message);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod dedup;
pub mod events;
pub mod extract;
pub mod http;
pub mod ledger;
pub mod manager;
pub mod outcome;
pub mod ownership;
pub mod paths;
pub mod persist;
pub mod pipeline;
pub mod presence;
pub mod resolver;
pub mod transfer;
pub mod types;

// Re-export commonly used items
pub use ledger::{JobLedger, LedgerEntry};
pub use manager::{DownloadHandle, DownloadManager};
pub use outcome::{FatalKind, JobOutcome, TransientKind};
pub use ownership::{OwnedGame, OwnershipLedger, OwnershipMap};
pub use pipeline::JobRunner;
pub use types::{Job, JobProgress, JobStatus, Provider, TaskId, TaskView};
