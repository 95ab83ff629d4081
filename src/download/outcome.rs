// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Final result of a job.
//!
//! Every exit path of a job collapses into one [`JobOutcome`]; the ledger,
//! the dedup registry and the status API all consume it the same way.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::JobStatus;

/// Failures that were retried and still did not go through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Connection,
    ServerError,
    RateLimited,
}

/// Failures that are never retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FatalKind {
    /// No provider produced a link, or a provider rejected the request.
    Resolution,
    /// Non-transient HTTP error from the file host.
    Http,
    /// Local filesystem error (permissions, disk full).
    LocalIo,
    Extraction,
    /// The job task crashed, or the peer it waited on failed.
    Internal,
}

/// Tagged result of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success { message: String },
    AlreadyPresent { message: String },
    Transient { kind: TransientKind, message: String },
    Fatal { kind: FatalKind, message: String },
    Canceled,
}

impl JobOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        JobOutcome::Success { message: message.into() }
    }

    pub fn already_present(message: impl Into<String>) -> Self {
        JobOutcome::AlreadyPresent { message: message.into() }
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        JobOutcome::Fatal { kind, message: message.into() }
    }

    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        JobOutcome::Transient { kind, message: message.into() }
    }

    /// Success or AlreadyPresent.
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. } | JobOutcome::AlreadyPresent { .. })
    }

    /// Terminal ledger status for this outcome.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } | JobOutcome::AlreadyPresent { .. } => JobStatus::DownloadOk,
            JobOutcome::Transient { .. } | JobOutcome::Fatal { .. } => JobStatus::Failed,
            JobOutcome::Canceled => JobStatus::Canceled,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobOutcome::Success { message }
            | JobOutcome::AlreadyPresent { message }
            | JobOutcome::Transient { message, .. }
            | JobOutcome::Fatal { message, .. } => message,
            JobOutcome::Canceled => "Download canceled",
        }
    }

    /// `(success, message)` pair shared with duplicate requesters.
    pub fn summary(&self) -> (bool, String) {
        (self.is_success(), self.message().to_string())
    }

    /// Outcome of a duplicate requester, from the leader's shared result.
    pub fn from_shared((success, message): (bool, String)) -> Self {
        if success {
            JobOutcome::Success { message }
        } else {
            JobOutcome::Fatal { kind: FatalKind::Internal, message }
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status(), self.message())
    }
}
