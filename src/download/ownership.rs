// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ownership ledger: which games have been fetched, per platform.
//!
//! `{platform: {game: {timestamp, size}}}`. Entries are added, never removed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::persist::{self, LOCK_TIMEOUT};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnedGame {
    /// `%Y-%m-%d %H:%M:%S`, local time.
    pub timestamp: String,
    /// Bytes on disk, when known.
    pub size: Option<u64>,
}

pub type OwnershipMap = BTreeMap<String, BTreeMap<String, OwnedGame>>;

/// Store object for the ownership file.
#[derive(Debug, Clone)]
pub struct OwnershipLedger {
    path: PathBuf,
}

impl OwnershipLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_unlocked(&self) -> Result<OwnershipMap> {
        match persist::read_unlocked(&self.path)? {
            Some(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse ownership file: {:?}", self.path)),
            _ => Ok(OwnershipMap::new()),
        }
    }

    pub fn load(&self) -> Result<OwnershipMap> {
        if !self.path.exists() {
            return Ok(OwnershipMap::new());
        }
        let _lock = persist::acquire_shared(&persist::lock_path_for(&self.path), LOCK_TIMEOUT)?;
        self.read_unlocked()
    }

    /// Record `game` under `platform`, replacing an older record.
    pub fn mark_owned(&self, platform: &str, game: &str, size: Option<u64>) -> Result<()> {
        let _lock = persist::acquire_exclusive(&persist::lock_path_for(&self.path), LOCK_TIMEOUT)?;
        let mut owned = self.read_unlocked()?;
        owned.entry(platform.to_string()).or_default().insert(
            game.to_string(),
            OwnedGame {
                timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                size,
            },
        );
        let content = serde_json::to_string_pretty(&owned)
            .with_context(|| "Failed to serialize ownership ledger")?;
        persist::write_atomic_unlocked(&self.path, content.as_bytes())?;
        tracing::debug!(target: "download::ownership", "Marked {}/{} as owned", platform, game);
        Ok(())
    }

    pub fn is_owned(&self, platform: &str, game: &str) -> Result<bool> {
        Ok(self
            .load()?
            .get(platform)
            .is_some_and(|games| games.contains_key(game)))
    }
}
