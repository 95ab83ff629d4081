// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Anonymous free-mode scrape of a locker landing page.
//!
//! Landing page -> optional countdown -> form resubmission (bounded) -> link
//! search -> candidate validation. The patterns below track the locker's
//! current markup; expect to revise them when its pages change.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;

use super::{ResolveError, ResolvedLink};
use crate::config::{ResolverSettings, TransferSettings};
use crate::download::events::{EventSink, JobEvent};
use crate::download::http::{self, BROWSER_USER_AGENT};
use crate::download::types::Provider;

/// Countdown patterns and the seconds each unit is worth, most specific first.
static WAIT_PATTERNS: Lazy<Vec<(Regex, u64)>> = Lazy::new(|| {
    [
        (r"(?i)var\s+ct\s*=\s*(\d+)\s*\*\s*60", 60),
        (r"(?i)(?:veuillez\s+)?patiente[rz]\s*(\d+)\s*(?:min|minute)s?\b", 60),
        (r"(?i)please\s+wait\s*(\d+)\s*(?:min|minute)s?\b", 60),
        (r"(?i)(?:veuillez\s+)?patiente[rz]\s*(\d+)\s*(?:sec|secondes?|s)\b", 1),
        (r"(?i)please\s+wait\s*(\d+)\s*(?:sec|seconds?)\b", 1),
        (r"(?i)var\s+ct\s*=\s*(\d+)\s*;", 1),
    ]
    .into_iter()
    .map(|(pattern, unit)| (Regex::new(pattern).expect("valid wait regex"), unit))
    .collect()
});

static FORM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)(<form[^>]*id=["']f1["'][^>]*>)(.*?)</form>"#).expect("valid form regex")
});
static INPUT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("valid input regex"));
static NAME_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bname\s*=\s*["']([^"']+)["']"#).expect("valid name regex"));
static VALUE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bvalue\s*=\s*["']([^"']*)["']"#).expect("valid value regex"));
static ACTION_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\baction\s*=\s*["']([^"']*)["']"#).expect("valid action regex"));

/// Where the file link hides, in order of trust.
static LINK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)href=["']([^"']+)["'][^>]*>\s*(?:cliquer|click|télécharger|download)"#,
        r#"(?i)href=["']([^"']*/dl/[^"']+)"#,
        r#"(?i)(https?://[a-z0-9.-]*1fichier\.com/[A-Za-z0-9]{8,})"#,
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("valid link regex"))
    .collect()
});

/// Account pages that look like download links.
const BLOCKED_SUBSTRINGS: &[&str] = &["/register", "/login", "/inscription", "/compte", "/subscribe"];

/// Countdown imposed by the page, in seconds.
pub fn extract_wait_seconds(html: &str) -> Option<u64> {
    WAIT_PATTERNS.iter().find_map(|(regex, unit)| {
        let value: u64 = regex.captures(html)?.get(1)?.as_str().parse().ok()?;
        Some(value.saturating_mul(*unit)).filter(|secs| *secs > 0)
    })
}

/// The download form and its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FormData {
    pub action: Option<String>,
    pub fields: Vec<(String, String)>,
}

pub fn parse_form(html: &str) -> Option<FormData> {
    let captures = FORM.captures(html)?;
    let open_tag = captures.get(1)?.as_str();
    let body = captures.get(2)?.as_str();

    let action = ACTION_ATTR
        .captures(open_tag)
        .and_then(|c| c.get(1))
        .map(|m| http::html_unescape(m.as_str()))
        .filter(|a| !a.trim().is_empty());

    let fields = INPUT
        .find_iter(body)
        .filter_map(|input| {
            let tag = input.as_str();
            let name = NAME_ATTR.captures(tag)?.get(1)?.as_str();
            let value = VALUE_ATTR
                .captures(tag)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .unwrap_or("");
            Some((http::html_unescape(name), http::html_unescape(value)))
        })
        .collect();

    Some(FormData { action, fields })
}

/// Candidate links in pattern order, without duplicates.
pub fn find_candidate_links(html: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for pattern in LINK_PATTERNS.iter() {
        for captures in pattern.captures_iter(html) {
            if let Some(m) = captures.get(1) {
                let link = http::html_unescape(m.as_str());
                if !found.contains(&link) {
                    found.push(link);
                }
            }
        }
    }
    found
}

fn is_blocked(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    BLOCKED_SUBSTRINGS.iter().any(|b| lower.contains(b))
}

fn network(source: reqwest::Error) -> ResolveError {
    ResolveError::Network { provider: Provider::Free, source }
}

/// One free-mode session. Holds the cookie jar for the landing page.
pub(super) struct FreeMode {
    client: Client,
    wait_tick: Duration,
    max_form_attempts: u32,
    check_timeout: Duration,
}

impl FreeMode {
    pub(super) fn new(settings: &ResolverSettings, transfer: &TransferSettings) -> Result<Self, ResolveError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(Duration::from_secs(transfer.connect_timeout_secs))
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            wait_tick: settings.wait_tick(),
            max_form_attempts: settings.max_form_attempts,
            check_timeout: settings.request_timeout(),
        })
    }

    pub(super) async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ResolvedLink, ResolveError> {
        let response = self.client.get(link).send().await.map_err(network)?;
        let mut page_url = response.url().clone();
        let mut html = response.text().await.map_err(network)?;

        let mut attempts = 0;
        loop {
            if let Some(seconds) = extract_wait_seconds(&html) {
                tracing::info!(target: "download::resolver", "Free mode countdown: {}s", seconds);
                self.countdown(seconds, cancel, events).await?;
            }

            let Some(form) = parse_form(&html) else { break };
            if attempts >= self.max_form_attempts {
                break;
            }
            attempts += 1;
            events.message(format!("Submitting download form ({}/{})", attempts, self.max_form_attempts));

            let target = form
                .action
                .as_deref()
                .and_then(|action| page_url.join(action).ok())
                .unwrap_or_else(|| page_url.clone());
            let response = self
                .client
                .post(target)
                .form(&form.fields)
                .send()
                .await
                .map_err(network)?;
            page_url = response.url().clone();
            html = response.text().await.map_err(network)?;

            if extract_wait_seconds(&html).is_none() {
                break;
            }
        }

        for candidate in find_candidate_links(&html) {
            if cancel.is_cancelled() {
                return Err(ResolveError::Canceled);
            }
            let Ok(url) = page_url.join(&candidate) else { continue };
            if let Some(resolved) = self.validate(url).await {
                return Ok(resolved);
            }
        }

        Err(ResolveError::LinkNotFound { provider: Provider::Free })
    }

    /// Sleep through a countdown one tick at a time, watching the token.
    async fn countdown(
        &self,
        seconds: u64,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<(), ResolveError> {
        for remaining in (1..=seconds).rev() {
            events.emit(JobEvent::Waiting { remaining, total: seconds });
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Canceled),
                _ = tokio::time::sleep(self.wait_tick) => {}
            }
        }
        Ok(())
    }

    /// Accept `url` if it serves something other than an HTML page.
    async fn validate(&self, url: Url) -> Option<ResolvedLink> {
        if is_blocked(url.as_str()) {
            tracing::debug!(target: "download::resolver", "Rejecting account page {}", url);
            return None;
        }

        let head = self.client.head(url.clone()).timeout(self.check_timeout).send().await;
        let response = match head {
            Ok(r) if r.status().is_success() => r,
            _ => {
                // HEAD refused; look at the start of a real GET instead
                let mut r = self
                    .client
                    .get(url.clone())
                    .timeout(self.check_timeout)
                    .send()
                    .await
                    .ok()?;
                if !r.status().is_success() {
                    return None;
                }
                if let Ok(Some(first)) = r.chunk().await {
                    let sniff = String::from_utf8_lossy(&first[..first.len().min(512)]).to_ascii_lowercase();
                    if sniff.trim_start().starts_with("<!doctype html") || sniff.contains("<html") {
                        return None;
                    }
                }
                r
            }
        };

        if http::is_html(response.headers()) {
            tracing::debug!(target: "download::resolver", "Rejecting HTML candidate {}", url);
            return None;
        }

        Some(ResolvedLink {
            url: url.to_string(),
            filename: http::disposition_filename(response.headers()),
            size: http::content_length(response.headers()),
            provider: Provider::Free,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_wait_patterns() {
        assert_eq!(extract_wait_seconds("<script>var ct = 2 * 60;</script>"), Some(120));
        assert_eq!(extract_wait_seconds("var ct = 45;"), Some(45));
        assert_eq!(extract_wait_seconds("Veuillez patienter 3 minutes"), Some(180));
        assert_eq!(extract_wait_seconds("You must wait. Please wait 30 seconds"), Some(30));
        assert_eq!(extract_wait_seconds("patientez 10 sec"), Some(10));
        assert_eq!(extract_wait_seconds("Please wait 1 min"), Some(60));
        assert_eq!(extract_wait_seconds("var ct = 0;"), None);
        assert_eq!(extract_wait_seconds("<p>No wait here</p>"), None);
    }

    #[test]
    fn test_parse_form() {
        let html = r#"
            <form method="post" id="f1" action="/dl">
              <input type="hidden" name="adz" value="1.2&amp;3">
              <input type="checkbox" name="dl_no_ssl" value="on" />
              <input type="submit" value="Download">
            </form>"#;
        let form = parse_form(html).unwrap();
        assert_eq!(form.action.as_deref(), Some("/dl"));
        assert_eq!(
            form.fields,
            vec![
                ("adz".to_string(), "1.2&3".to_string()),
                ("dl_no_ssl".to_string(), "on".to_string()),
            ]
        );
        assert!(parse_form("<form id='other'></form>").is_none());
    }

    #[test]
    fn test_candidate_order_and_dedup() {
        let html = r#"
            <a href="https://cdn.example/dl/abc">mirror</a>
            <a href="https://a-7.1fichier.com/c9f8e7d6c5" class="ok btn-general">Click here to download</a>
            <a href="https://cdn.example/dl/abc">again</a>"#;
        let links = find_candidate_links(html);
        assert_eq!(links[0], "https://a-7.1fichier.com/c9f8e7d6c5");
        assert_eq!(links[1], "https://cdn.example/dl/abc");
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_blocklist() {
        assert!(is_blocked("https://1fichier.com/register.pl"));
        assert!(is_blocked("https://1fichier.com/LOGIN.pl"));
        assert!(!is_blocked("https://a-7.1fichier.com/c9f8e7d6c5"));
    }

    fn free_mode() -> FreeMode {
        let settings = ResolverSettings { wait_tick_ms: 1, ..ResolverSettings::default() };
        FreeMode::new(&settings, &TransferSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_form_flow_with_second_countdown() {
        let server = MockServer::start().await;
        let form = r#"<form id="f1" method="post"><input type="hidden" name="adz" value="42"></form>"#;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("var ct = 2;{}", form)))
            .mount(&server)
            .await;
        // First submission answers with another countdown, second with the link
        Mock::given(method("POST"))
            .and(path("/landing"))
            .and(body_string_contains("adz=42"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("please wait 1 sec{}", form)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/landing"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<a href="/files/a.zip">Click here to download</a>"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/files/a.zip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/zip")
                    .insert_header("content-disposition", "attachment; filename=\"Foo (USA).zip\""),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let resolved = free_mode()
            .resolve(&format!("{}/landing", server.uri()), &CancellationToken::new(), &EventSink::new(tx))
            .await
            .unwrap();
        assert_eq!(resolved.url, format!("{}/files/a.zip", server.uri()));
        assert_eq!(resolved.filename.as_deref(), Some("Foo (USA).zip"));
        assert_eq!(resolved.provider, Provider::Free);

        let mut waits = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Waiting { remaining, total } = event {
                waits.push((remaining, total));
            }
        }
        assert_eq!(waits, vec![(2, 2), (1, 2), (1, 1)]);
    }

    #[tokio::test]
    async fn test_html_candidates_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/login.pl">Download</a><a href="/promo/dl/offer">x</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/promo/dl/offer"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/login.pl"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = free_mode()
            .resolve(&format!("{}/landing", server.uri()), &CancellationToken::new(), &EventSink::detached())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "FREE: download link not found");
    }

    #[tokio::test]
    async fn test_head_failure_falls_back_to_get_sniff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/dl/page">Download</a><a href="/dl/file">Download</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><html></html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x50, 0x4b, 3, 4]))
            .mount(&server)
            .await;

        let resolved = free_mode()
            .resolve(&format!("{}/landing", server.uri()), &CancellationToken::new(), &EventSink::detached())
            .await
            .unwrap();
        assert!(resolved.url.ends_with("/dl/file"));
    }

    #[tokio::test]
    async fn test_countdown_observes_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("var ct = 5 * 60;"))
            .mount(&server)
            .await;

        let settings = ResolverSettings { wait_tick_ms: 1000, ..ResolverSettings::default() };
        let mode = FreeMode::new(&settings, &TransferSettings::default()).unwrap();
        let token = CancellationToken::new();
        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        let started = std::time::Instant::now();
        let err = mode
            .resolve(&format!("{}/landing", server.uri()), &token, &EventSink::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
