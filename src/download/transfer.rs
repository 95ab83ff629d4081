// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer engine: stream a resolved URL to disk.
//!
//! Bytes land in `<dest>.part` and are renamed into place once complete.
//! Hosts that answer 401/403 are retried under the next header profile;
//! timeouts, resets, 408, 429 and 5xx get a few delayed retries within the
//! current profile, resuming with `Range` when the host supports it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ACCEPT_RANGES, CONNECTION, RANGE, REFERER, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use super::events::{EventSink, JobEvent, TransferProgress};
use super::http::{content_length, BROWSER_USER_AGENT};
use super::outcome::TransientKind;
use crate::config::TransferSettings;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Download canceled")]
    Canceled,

    /// The host refused the request and retrying would not help.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// Retries exhausted on a transient failure.
    #[error("{message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TransferError::Io { path: path.to_path_buf(), source }
    }

    fn is_auth_rejection(&self) -> bool {
        matches!(self, TransferError::Rejected { status: 401 | 403, .. })
    }
}

/// What a finished transfer left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: PathBuf,
    pub bytes: u64,
}

/// One set of request headers in the 401/403 ladder.
#[derive(Debug, Clone)]
pub struct HeaderProfile {
    pub name: &'static str,
    pub headers: HeaderMap,
}

impl HeaderProfile {
    /// Default, generic, minimal, referer-qualified; in that order.
    pub fn ladder(url: &str) -> Vec<HeaderProfile> {
        let browser = HeaderValue::from_static(BROWSER_USER_AGENT);

        let mut default = HeaderMap::new();
        default.insert(USER_AGENT, browser.clone());
        default.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

        let mut generic = HeaderMap::new();
        generic.insert(USER_AGENT, browser.clone());
        generic.insert(ACCEPT, HeaderValue::from_static("application/octet-stream,*/*;q=0.8"));
        generic.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        generic.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let mut minimal = HeaderMap::new();
        minimal.insert(USER_AGENT, HeaderValue::from_static("curl/8.4.0"));
        minimal.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let mut referer = HeaderMap::new();
        referer.insert(USER_AGENT, browser);
        referer.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if let Some(origin) = origin_of(url) {
            referer.insert(REFERER, origin);
        }

        vec![
            HeaderProfile { name: "default", headers: default },
            HeaderProfile { name: "generic", headers: generic },
            HeaderProfile { name: "minimal", headers: minimal },
            HeaderProfile { name: "referer", headers: referer },
        ]
    }
}

fn origin_of(url: &str) -> Option<HeaderValue> {
    let parsed = Url::parse(url).ok()?;
    if !parsed.has_host() {
        return None;
    }
    HeaderValue::from_str(&format!("{}/", parsed.origin().ascii_serialization())).ok()
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Status codes retried in place.
fn transient_status(status: StatusCode) -> Option<TransientKind> {
    match status.as_u16() {
        408 => Some(TransientKind::Timeout),
        429 => Some(TransientKind::RateLimited),
        500..=599 => Some(TransientKind::ServerError),
        _ => None,
    }
}

fn classify(err: &reqwest::Error) -> Option<TransientKind> {
    if err.is_timeout() {
        Some(TransientKind::Timeout)
    } else if err.is_connect() || err.is_body() || err.is_decode() || err.is_request() {
        Some(TransientKind::Connection)
    } else {
        None
    }
}

fn status_detail(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Authentication required (HTTP 401)".to_string(),
        403 => "Access denied (HTTP 403)".to_string(),
        code => format!("HTTP error {}", code),
    }
}

fn rejection_message(status: StatusCode, attempts: usize) -> String {
    format!("Connection failed after {} attempts - {}", attempts, status_detail(status))
}

/// Samples throughput at a bounded interval.
struct ProgressMeter {
    interval: Duration,
    last_sample: Instant,
    last_bytes: u64,
    speed: f64,
}

impl ProgressMeter {
    fn new(interval: Duration, start_bytes: u64) -> Self {
        Self {
            interval,
            last_sample: Instant::now(),
            last_bytes: start_bytes,
            speed: 0.0,
        }
    }

    /// Emit a sample if the interval elapsed (or `force` is set).
    fn sample(&mut self, downloaded: u64, total: Option<u64>, events: &EventSink, force: bool) {
        let elapsed = self.last_sample.elapsed();
        if !force && elapsed < self.interval {
            return;
        }
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.speed = downloaded.saturating_sub(self.last_bytes) as f64 / secs / BYTES_PER_MB;
        }
        self.last_sample = Instant::now();
        self.last_bytes = downloaded;
        events.emit(JobEvent::Progress(TransferProgress { downloaded, total, speed: self.speed }));
    }
}

/// Why one streaming pass stopped early.
enum PassError {
    Transient(TransientKind, String),
    Fatal(TransferError),
}

impl From<TransferError> for PassError {
    fn from(err: TransferError) -> Self {
        PassError::Fatal(err)
    }
}

/// Streams resolved URLs to disk.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: Client,
    settings: TransferSettings,
}

impl TransferEngine {
    pub fn new(settings: TransferSettings) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(TransferError::Request)?;
        Ok(Self { client, settings })
    }

    /// Download `url` to `dest`.
    ///
    /// On any failure or cancellation the partial file is removed and `dest`
    /// is left untouched.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<TransferReport, TransferError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        let part = part_path(dest);
        let ladder = HeaderProfile::ladder(url);
        let mut last_rejection = None;

        for (index, profile) in ladder.iter().enumerate() {
            events.message(format!("Try {}/{}", index + 1, ladder.len()));
            tracing::debug!(target: "download::transfer", "GET {} with {} headers", url, profile.name);

            match self.stream_with_retries(url, profile, &part, cancel, events).await {
                Ok(bytes) => {
                    return self.finalize(&part, dest, bytes).await.inspect_err(|_| {
                        let _ = std::fs::remove_file(&part);
                    });
                }
                Err(err) if err.is_auth_rejection() => {
                    tracing::debug!(target: "download::transfer", "{} profile rejected: {}", profile.name, err);
                    last_rejection = Some(err);
                }
                Err(err) => {
                    discard(&part).await;
                    return Err(err);
                }
            }
        }

        discard(&part).await;
        Err(match last_rejection {
            Some(TransferError::Rejected { status, .. }) => TransferError::Rejected {
                status,
                message: rejection_message(StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN), ladder.len()),
            },
            Some(other) => other,
            None => TransferError::Rejected {
                status: 403,
                message: rejection_message(StatusCode::FORBIDDEN, ladder.len()),
            },
        })
    }

    async fn finalize(&self, part: &Path, dest: &Path, bytes: u64) -> Result<TransferReport, TransferError> {
        tokio::fs::rename(part, dest).await.map_err(|e| TransferError::io(dest, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o644)).await {
                tracing::warn!(target: "download::transfer", "Could not set permissions on {:?}: {}", dest, e);
            }
        }

        tracing::info!(target: "download::transfer", "Saved {:?} ({} bytes)", dest, bytes);
        Ok(TransferReport { path: dest.to_path_buf(), bytes })
    }

    /// One header profile: stream, retrying transient failures with backoff.
    async fn stream_with_retries(
        &self,
        url: &str,
        profile: &HeaderProfile,
        part: &Path,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<u64, TransferError> {
        let mut state = PassState::default();
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Canceled);
            }

            match self.stream_once(url, profile, part, &mut state, cancel, events).await {
                Ok(bytes) => return Ok(bytes),
                Err(PassError::Fatal(err)) => return Err(err),
                Err(PassError::Transient(kind, message)) => {
                    failures += 1;
                    if failures > self.settings.transient_retries {
                        return Err(TransferError::Transient {
                            kind,
                            message: format!("{} (after {} attempts)", message, failures),
                        });
                    }
                    let delay = self.settings.retry_base_delay() * 2u32.saturating_pow(failures - 1);
                    tracing::warn!(
                        target: "download::transfer",
                        "{}; retry {}/{} in {:?}",
                        message, failures, self.settings.transient_retries, delay
                    );
                    events.message(format!("{}, retrying ({}/{})", message, failures, self.settings.transient_retries));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One request and as much of its body as the connection delivers.
    async fn stream_once(
        &self,
        url: &str,
        profile: &HeaderProfile,
        part: &Path,
        state: &mut PassState,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<u64, PassError> {
        let resume_from = (state.written > 0 && state.accepts_ranges).then_some(state.written);

        let mut request = self.client.get(url).headers(profile.headers.clone());
        if let Some(offset) = resume_from {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Canceled.into()),
            sent = request.send() => sent,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return Err(match classify(&e) {
                    Some(kind) => PassError::Transient(kind, format!("Network error: {}", e)),
                    None => PassError::Fatal(TransferError::Request(e)),
                })
            }
        };

        let status = response.status();
        let resuming = resume_from.is_some() && status == StatusCode::PARTIAL_CONTENT;
        if !status.is_success() {
            if let Some(kind) = transient_status(status) {
                return Err(PassError::Transient(kind, format!("Server answered HTTP {}", status.as_u16())));
            }
            return Err(PassError::Fatal(TransferError::Rejected {
                status: status.as_u16(),
                message: status_detail(status),
            }));
        }

        let file = if resuming {
            tracing::info!(target: "download::transfer", "Resuming at byte {}", state.written);
            OpenOptions::new()
                .append(true)
                .open(part)
                .await
                .map_err(|e| TransferError::io(part, e))?
        } else {
            state.written = 0;
            state.total = content_length(response.headers());
            state.accepts_ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            events.emit(JobEvent::Started { total: state.total });
            File::create(part).await.map_err(|e| TransferError::io(part, e))?
        };
        let mut writer = BufWriter::with_capacity(self.settings.chunk_size.max(8 * 1024), file);

        let read_timeout = Duration::from_secs(self.settings.read_timeout_secs);
        let mut meter = ProgressMeter::new(self.settings.progress_interval(), state.written);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Canceled.into()),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    flush_quietly(&mut writer).await;
                    return Err(PassError::Transient(TransientKind::Timeout, "Read timed out".to_string()));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    flush_quietly(&mut writer).await;
                    let kind = classify(&e).unwrap_or(TransientKind::Connection);
                    return Err(PassError::Transient(kind, format!("Connection lost: {}", e)));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            writer.write_all(&chunk).await.map_err(|e| TransferError::io(part, e))?;
            state.written += chunk.len() as u64;
            meter.sample(state.written, state.total, events, false);
        }

        writer.flush().await.map_err(|e| TransferError::io(part, e))?;
        writer.get_ref().sync_all().await.map_err(|e| TransferError::io(part, e))?;
        meter.sample(state.written, state.total.or(Some(state.written)), events, true);
        Ok(state.written)
    }
}

/// Carried between retries of one profile so a resume knows where it stands.
#[derive(Debug, Default)]
struct PassState {
    written: u64,
    total: Option<u64>,
    accepts_ranges: bool,
}

async fn flush_quietly(writer: &mut BufWriter<File>) {
    if let Err(e) = writer.flush().await {
        tracing::debug!(target: "download::transfer", "Flush before retry failed: {}", e);
    }
}

async fn discard(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => tracing::debug!(target: "download::transfer", "Removed partial file {:?}", part),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(target: "download::transfer", "Could not remove {:?}: {}", part, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> TransferEngine {
        TransferEngine::new(TransferSettings {
            retry_base_delay_ms: 1,
            progress_interval_ms: 0,
            transient_retries: 2,
            chunk_size: 16 * 1024,
            ..TransferSettings::default()
        })
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_ladder_shape() {
        let ladder = HeaderProfile::ladder("https://files.example.org/dir/a.zip");
        let names: Vec<_> = ladder.iter().map(|p| p.name).collect();
        assert_eq!(names, ["default", "generic", "minimal", "referer"]);
        assert_eq!(ladder[2].headers[USER_AGENT], "curl/8.4.0");
        assert_eq!(ladder[3].headers[REFERER], "https://files.example.org/");
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path(Path::new("/r/snes/Foo.zip")), PathBuf::from("/r/snes/Foo.zip.part"));
    }

    #[tokio::test]
    async fn test_streams_to_destination() {
        let server = MockServer::start().await;
        let body = vec![7u8; 300 * 1024];
        Mock::given(method("GET"))
            .and(path("/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("snes").join("Foo.zip");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = engine()
            .fetch(&format!("{}/a.zip", server.uri()), &dest, &CancellationToken::new(), &EventSink::new(tx))
            .await
            .unwrap();

        assert_eq!(report.bytes, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!part_path(&dest).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        // Percent stays in range and never goes backwards
        let percents: Vec<u8> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Progress(p) => Some(p.percent()),
                _ => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| *p <= 100));
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_header_ladder_on_403() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "curl/8.4.0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"rom".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("Foo.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine()
            .fetch(&format!("{}/Foo.bin", server.uri()), &dest, &CancellationToken::new(), &EventSink::new(tx))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"rom");

        let tries: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Message(m) if m.starts_with("Try ") => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(tries, ["Try 1/4", "Try 2/4", "Try 3/4"]);
    }

    #[tokio::test]
    async fn test_all_profiles_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(4)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("Foo.bin");
        let err = engine()
            .fetch(&format!("{}/Foo.bin", server.uri()), &dest, &CancellationToken::new(), &EventSink::detached())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Connection failed after 4 attempts - Authentication required (HTTP 401)");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_not_found_fails_without_ladder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = engine()
            .fetch(
                &format!("{}/gone.zip", server.uri()),
                &dir.path().join("gone.zip"),
                &CancellationToken::new(),
                &EventSink::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_transient_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let report = engine()
            .fetch(&format!("{}/a.bin", server.uri()), &dest, &CancellationToken::new(), &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(report.bytes, 2);
    }

    #[tokio::test]
    async fn test_transient_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = engine()
            .fetch(
                &format!("{}/a.bin", server.uri()),
                &dir.path().join("a.bin"),
                &CancellationToken::new(),
                &EventSink::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transient { kind: TransientKind::RateLimited, .. }));
    }

    /// Raw HTTP responder for body truncation, which wiremock cannot produce.
    /// Serves one canned reply per connection and returns the request heads it saw.
    async fn scripted_host(replies: Vec<Vec<u8>>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                heads.push(String::from_utf8_lossy(&head).to_lowercase());
                socket.write_all(&reply).await.unwrap();
                let _ = socket.shutdown().await;
            }
            heads
        });
        (format!("http://{}", addr), handle)
    }

    fn truncated_reply() -> Vec<u8> {
        // Promises ten bytes, delivers five, then hangs up
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\nhello".to_vec()
    }

    fn started_totals(events: &[JobEvent]) -> Vec<Option<u64>> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Started { total } => Some(*total),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_resumes_with_range_after_connection_loss() {
        let (base, host) = scripted_host(vec![
            truncated_reply(),
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 5-9/10\r\nContent-Length: 5\r\nConnection: close\r\n\r\nworld".to_vec(),
        ])
        .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("Foo.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = engine()
            .fetch(&format!("{}/Foo.bin", base), &dest, &CancellationToken::new(), &EventSink::new(tx))
            .await
            .unwrap();

        assert_eq!(report.bytes, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"helloworld");
        assert!(!part_path(&dest).exists());

        let heads = host.await.unwrap();
        assert!(!heads[0].contains("range:"));
        assert!(heads[1].contains("range: bytes=5-"), "{}", heads[1]);

        let events = drain(&mut rx);
        // One start only: the resumed pass continues the same progress
        assert_eq!(started_totals(&events), [Some(10)]);
        let last = events
            .iter()
            .rev()
            .find_map(|e| match e {
                JobEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .unwrap();
        assert_eq!(last.downloaded, 10);
        assert_eq!(last.percent(), 100);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let (base, host) = scripted_host(vec![
            truncated_reply(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\nhelloworld".to_vec(),
        ])
        .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("Foo.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = engine()
            .fetch(&format!("{}/Foo.bin", base), &dest, &CancellationToken::new(), &EventSink::new(tx))
            .await
            .unwrap();

        // Truncated and rewritten, not appended
        assert_eq!(report.bytes, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"helloworld");

        let heads = host.await.unwrap();
        assert!(heads[1].contains("range: bytes=5-"), "{}", heads[1]);
        assert_eq!(started_totals(&drain(&mut rx)), [Some(10), Some(10)]);
    }

    #[tokio::test]
    async fn test_cancel_before_first_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 1024]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let token = CancellationToken::new();
        token.cancel();

        let err = engine()
            .fetch(&format!("{}/a.bin", server.uri()), &dest, &token, &EventSink::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Canceled));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_removes_part() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 1024])
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let token = CancellationToken::new();
        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        let err = engine()
            .fetch(&format!("{}/a.bin", server.uri()), &dest, &token, &EventSink::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Canceled));
        assert!(!part_path(&dest).exists());
    }
}
