// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Link resolution: source URL in, directly streamable URL out.
//!
//! Plain HTTP hosts resolve to themselves. Locker links go through the
//! provider chain, first success wins:
//!
//! ```text
//! credential for 1F? ──yes──▶ authenticated API ──▶ link or terminal error
//!        │ no
//!        ▼
//! unlock service A (AD) ──fail──▶ unlock service B (RD) ──fail──▶ free mode
//! ```
//!
//! Once a locker credential is configured its failures are final; fallback
//! only happens when there is no credential.

mod debrid;
mod free;
mod onefichier;

use std::sync::Arc;

use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::events::{EventSink, JobEvent};
use super::paths::strip_affiliate;
use super::types::Provider;
use crate::config::{Credentials, Settings};

pub use free::{extract_wait_seconds, find_candidate_links, parse_form};

/// A link that can be streamed as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub url: String,
    /// Name reported by the provider, if any.
    pub filename: Option<String>,
    /// Size reported by the provider, if any.
    pub size: Option<u64>,
    pub provider: Provider,
}

impl ResolvedLink {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
            size: None,
            provider: Provider::Direct,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// A provider refused the request. The message is provider-prefixed.
    #[error("{0}")]
    Rejected(String),

    #[error("{provider}: download link not found")]
    LinkNotFound { provider: Provider },

    #[error("{provider}: request failed: {source}")]
    Network {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },

    #[error("resolution canceled")]
    Canceled,
}

/// What to resolve.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub source_url: &'a str,
    pub display_name: &'a str,
    pub credentials: &'a Credentials,
}

/// Runs the provider chain.
#[derive(Debug, Clone)]
pub struct LinkResolver {
    client: Client,
    settings: Arc<Settings>,
}

impl LinkResolver {
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        Self { client, settings }
    }

    pub async fn resolve(
        &self,
        request: ResolveRequest<'_>,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ResolvedLink, ResolveError> {
        if !self.settings.is_locker_url(request.source_url) {
            return Ok(ResolvedLink::direct(request.source_url));
        }

        let link = strip_affiliate(request.source_url);
        let endpoints = &self.settings.endpoints;
        let timeout = self.settings.resolver.request_timeout();
        events.message("Resolving link");

        if let Some(key) = request.credentials.onefichier.as_deref() {
            events.emit(JobEvent::Provider(Provider::OneFichier));
            tracing::debug!(target: "download::resolver", "Using 1F API for {}", link);
            return onefichier::resolve(
                &self.client,
                &endpoints.onefichier,
                key,
                link,
                request.display_name,
                timeout,
            )
            .await;
        }

        if let Some(key) = request.credentials.alldebrid.as_deref() {
            check_cancel(cancel)?;
            match debrid::alldebrid_unlock(
                &self.client,
                &endpoints.alldebrid,
                &endpoints.alldebrid_agent,
                key,
                link,
                timeout,
            )
            .await
            {
                Ok(resolved) => {
                    events.emit(JobEvent::Provider(Provider::AllDebrid));
                    return Ok(resolved);
                }
                Err(e) => tracing::warn!(target: "download::resolver", "AD unlock failed: {}", e),
            }
        }

        if let Some(key) = request.credentials.realdebrid.as_deref() {
            check_cancel(cancel)?;
            match debrid::realdebrid_unlock(&self.client, &endpoints.realdebrid, key, link, timeout).await {
                Ok(resolved) => {
                    events.emit(JobEvent::Provider(Provider::RealDebrid));
                    return Ok(resolved);
                }
                Err(e) => tracing::warn!(target: "download::resolver", "RD unlock failed: {}", e),
            }
        }

        check_cancel(cancel)?;
        events.emit(JobEvent::Provider(Provider::Free));
        free::FreeMode::new(&self.settings.resolver, &self.settings.transfer)?
            .resolve(link, cancel, events)
            .await
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), ResolveError> {
    if cancel.is_cancelled() {
        Err(ResolveError::Canceled)
    } else {
        Ok(())
    }
}
