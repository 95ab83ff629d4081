// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One cancellation token per task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::types::TaskId;
use crate::sync::resilient_lock;

#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `task_id`, created on first use.
    pub fn register(&self, task_id: TaskId) -> CancellationToken {
        resilient_lock(&self.tokens).entry(task_id).or_default().clone()
    }

    /// Set the token. Returns false when no token exists for `task_id`.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match resilient_lock(&self.tokens).get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Set every token. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let tokens = resilient_lock(&self.tokens);
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Forget a finished task.
    pub fn remove(&self, task_id: TaskId) {
        resilient_lock(&self.tokens).remove(&task_id);
    }
}
