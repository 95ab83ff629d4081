// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-flight registry: at most one transfer per source URL.
//!
//! The first job admitted for a URL becomes its leader and receives a
//! [`FlightGuard`]. Anyone else asking for the same URL while the leader runs
//! becomes a [`Follower`] and waits for the leader's `(success, message)`.
//!
//! The guard releases the URL and fires the completion signal exactly once,
//! either explicitly through [`FlightGuard::complete`] or from `Drop` when the
//! leader's task unwinds or is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::sync::resilient_lock;

/// `(success, message)` shared with duplicate requesters.
pub type SharedResult = (bool, String);

type Flights = HashMap<String, watch::Sender<Option<SharedResult>>>;

#[derive(Debug, Clone)]
pub struct InFlightRegistry {
    flights: Arc<Mutex<Flights>>,
    results: Arc<Mutex<HashMap<String, SharedResult>>>,
    wait_ceiling: Duration,
}

/// Outcome of asking to run a URL.
#[derive(Debug)]
pub enum Admission {
    Leader(FlightGuard),
    Follower(Follower),
}

impl InFlightRegistry {
    pub fn new(wait_ceiling: Duration) -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
            wait_ceiling,
        }
    }

    /// Claim `url`, or join the job that already holds it.
    pub fn admit(&self, url: &str) -> Admission {
        let mut flights = resilient_lock(&self.flights);
        if let Some(tx) = flights.get(url) {
            return Admission::Follower(Follower {
                url: url.to_string(),
                rx: tx.subscribe(),
                wait_ceiling: self.wait_ceiling,
            });
        }

        let (tx, _rx) = watch::channel(None);
        flights.insert(url.to_string(), tx);
        Admission::Leader(FlightGuard {
            registry: self.clone(),
            url: url.to_string(),
            released: false,
        })
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        resilient_lock(&self.flights).contains_key(url)
    }

    pub fn in_flight_count(&self) -> usize {
        resilient_lock(&self.flights).len()
    }

    /// Last result recorded for `url`.
    pub fn cached_result(&self, url: &str) -> Option<SharedResult> {
        resilient_lock(&self.results).get(url).cloned()
    }

    fn release(&self, url: &str, result: SharedResult) {
        resilient_lock(&self.results).insert(url.to_string(), result.clone());
        let sender = resilient_lock(&self.flights).remove(url);
        if let Some(tx) = sender {
            tx.send_replace(Some(result));
        }
    }
}

/// Leadership over one URL. Releases the URL when completed or dropped.
#[derive(Debug)]
pub struct FlightGuard {
    registry: InFlightRegistry,
    url: String,
    released: bool,
}

impl FlightGuard {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Publish the result to followers and release the URL.
    pub fn complete(mut self, result: SharedResult) {
        self.registry.release(&self.url, result);
        self.released = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                target: "download::dedup",
                "Job for {} ended without a result; releasing",
                self.url
            );
            self.registry
                .release(&self.url, (false, "Download interrupted".to_string()));
        }
    }
}

/// A duplicate requester waiting on the leader.
#[derive(Debug)]
pub struct Follower {
    url: String,
    rx: watch::Receiver<Option<SharedResult>>,
    wait_ceiling: Duration,
}

impl Follower {
    /// Wait for the leader's result.
    ///
    /// Past the wait ceiling the follower gives up and reports success.
    pub async fn wait(mut self) -> SharedResult {
        let rx = &mut self.rx;
        let outcome = tokio::time::timeout(self.wait_ceiling, async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return last.unwrap_or_else(|| (false, "Download interrupted".to_string()));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target: "download::dedup",
                    "Gave up waiting on in-flight download of {} after {:?}; assuming success",
                    self.url,
                    self.wait_ceiling
                );
                (true, "Assumed complete: in-flight download did not report back".to_string())
            }
        }
    }
}
