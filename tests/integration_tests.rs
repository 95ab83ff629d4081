//! End-to-end tests: queue, provider chain, transfer, ledgers and the HTTP API.
//!
//! Every remote party (locker landing page, provider APIs, file host) is a
//! local `wiremock` server; `127.0.0.1` is configured as a locker host so the
//! resolver chain runs against it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use romfetch::download::{JobStatus, Provider};
use romfetch::server::router;
use romfetch::{DownloadManager, Settings};

fn settings(root: &TempDir, server: &MockServer) -> Settings {
    let mut settings = Settings::rooted_at(root.path());
    settings.locker_hosts = vec!["127.0.0.1".to_string()];
    settings.endpoints.onefichier = format!("{}/1f", server.uri());
    settings.endpoints.alldebrid = format!("{}/ad", server.uri());
    settings.endpoints.realdebrid = format!("{}/rd", server.uri());
    settings.resolver.wait_tick_ms = 10;
    settings.transfer.retry_base_delay_ms = 1;
    settings.queue_poll_ms = 20;
    settings
}

/// Settings for plain-host tests: nothing is routed through the resolver chain.
fn direct_settings(root: &TempDir, server: &MockServer) -> Settings {
    let mut settings = settings(root, server);
    settings.locker_hosts = vec!["1fichier.com".to_string()];
    settings
}

fn manager(settings: Settings) -> DownloadManager {
    DownloadManager::new(Arc::new(settings)).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

// =============================================================================
// Free mode through the queue
// =============================================================================

#[tokio::test]
async fn test_free_mode_download_end_to_end() {
    let server = MockServer::start().await;
    let form = r#"<form id="f1" method="post"><input type="hidden" name="adz" value="7"></form>"#;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("var ct = 1;{}", form)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("adz=7"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"<a href="/files/c1">Click here to download</a>"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/files/c1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .insert_header("content-disposition", "attachment; filename=\"Foo (USA).sfc\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"rom bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let manager = manager(settings(&root, &server));
    let url = format!("{}/?abc123&af=42", server.uri());
    let mut handle = manager.enqueue(&url, "Foo", "SNES", false).unwrap();

    let done = handle.wait().await;
    assert_eq!(done.status, JobStatus::DownloadOk, "{}", done.message);
    assert_eq!(done.provider, Some(Provider::Free));
    assert_eq!(done.progress_percent, 100);
    assert_eq!(done.message, "Foo downloaded");

    let file = root.path().join("roms").join("snes").join("Foo (USA).sfc");
    assert_eq!(read(&file), b"rom bytes");

    let entry = manager.runner().ledger().entry(&url).unwrap().unwrap();
    assert_eq!(entry.status, JobStatus::DownloadOk);
    assert_eq!(entry.provider, Some(Provider::Free));
    assert!(manager.runner().ownership().is_owned("SNES", "Foo").unwrap());

    manager.shutdown().await;
}

// =============================================================================
// Credential failures are final
// =============================================================================

#[tokio::test]
async fn test_bad_locker_credential_fails_without_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1f/file/info.cgi"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"status": "KO", "message": "Bad token"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ad/link/unlock"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let mut settings = settings(&root, &server);
    settings.credentials.alldebrid = Some("AD-KEY".to_string());
    // Key files in data_dir are picked up per job
    std::fs::create_dir_all(&settings.data_dir).unwrap();
    std::fs::write(settings.data_dir.join("1FichierAPI.txt"), "BAD-KEY\n").unwrap();
    let manager = manager(settings);

    let url = format!("{}/?abc123", server.uri());
    let mut handle = manager.enqueue(&url, "Foo", "SNES", false).unwrap();
    let done = handle.wait().await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.message, "1F: invalid credential (API key rejected)");
    let entry = manager.runner().ledger().entry(&url).unwrap().unwrap();
    assert_eq!(entry.status, JobStatus::Failed);
    assert_eq!(entry.message, done.message);
    assert!(!manager.runner().ownership().is_owned("SNES", "Foo").unwrap());

    manager.shutdown().await;
}

// =============================================================================
// Duplicate enqueues
// =============================================================================

#[tokio::test]
async fn test_duplicate_enqueue_transfers_once() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/Foo.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "7")
                .set_body_bytes(b"payload".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Foo.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"payload".to_vec())
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let manager = manager(direct_settings(&root, &server));
    let url = format!("{}/Foo.zip", server.uri());

    let mut first = manager.enqueue(&url, "Foo", "NES", false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut second = manager.enqueue(&url, "Foo", "NES", false).unwrap();

    let a = first.wait().await;
    let b = second.wait().await;
    assert_eq!(a.status, JobStatus::DownloadOk);
    assert_eq!(b.status, JobStatus::DownloadOk);
    assert_eq!(b.message, "Foo: already present");

    let history = manager.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source_url, url);
    assert_eq!(history[0].status, JobStatus::DownloadOk);

    manager.shutdown().await;
}

// =============================================================================
// HTTP API
// =============================================================================

#[tokio::test]
async fn test_api_enqueue_then_poll() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Bar.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"zipdata".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let manager = Arc::new(manager(direct_settings(&root, &server)));
    let app = router(manager.clone());
    let url = format!("{}/Bar.zip", server.uri());

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/store/download")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"url": url, "game_name": "Bar", "platform": "Game Boy"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let queued = json_body(response).await;
    assert_eq!(queued["status"], "queued");
    let task_id = queued["task_id"].as_u64().unwrap();

    let response = app
        .clone()
        .oneshot(Request::get("/api/store/tasks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let tasks = json_body(response).await;
    assert_eq!(tasks["tasks"][0]["task_id"], task_id);
    assert_eq!(tasks["tasks"][0]["game_name"], "Bar");

    // Poll until the job leaves the task list
    let mut finished = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if manager.status().is_empty() {
            finished = true;
            break;
        }
    }
    assert!(finished);

    let response = app
        .clone()
        .oneshot(Request::get("/api/store/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let history = json_body(response).await;
    assert_eq!(history[0]["status"], "Download_OK");
    assert_eq!(history[0]["display_name"], "Bar");

    let response = app
        .clone()
        .oneshot(Request::get("/api/store/owned").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let owned = json_body(response).await;
    assert!(owned["Game Boy"]["Bar"].is_object());

    let response = app
        .oneshot(Request::delete("/api/store/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["cleared"], 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_api_cancel_all() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"x".to_vec())
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let manager = Arc::new(manager(direct_settings(&root, &server)));
    let app = router(manager.clone());
    let host = server.uri();

    let mut running = manager.enqueue(&format!("{}/a.zip", host), "A", "SNES", false).unwrap();
    let mut queued = manager.enqueue(&format!("{}/b.zip", host), "B", "SNES", false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = app
        .oneshot(Request::post("/api/store/cancel-all").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["canceled"], 2);

    assert_eq!(queued.wait().await.status, JobStatus::Canceled);
    let done = running.wait().await;
    assert_eq!(done.status, JobStatus::Canceled);
    assert_eq!(done.message, "Download canceled");
    assert!(!root.path().join("roms/snes/A.zip").exists());
    assert!(!root.path().join("roms/snes/A.zip.part").exists());

    manager.shutdown().await;
}
