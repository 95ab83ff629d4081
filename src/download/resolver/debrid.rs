// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unlock services. Each turns a locker link into a direct link, or explains
//! why not through a small static error table.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{ResolveError, ResolvedLink};
use crate::download::types::Provider;

/// AllDebrid `error.code` values worth translating.
const ALLDEBRID_ERRORS: &[(&str, &str)] = &[
    ("AUTH_BAD_APIKEY", "invalid credential (API key rejected)"),
    ("AUTH_BLOCKED", "account blocked, check the AllDebrid dashboard"),
    ("AUTH_USER_BANNED", "account banned"),
    ("LINK_HOST_NOT_SUPPORTED", "unsupported host"),
    ("LINK_DOWN", "file unavailable on the host"),
    ("LINK_PASS_PROTECTED", "link is password protected"),
    ("LINK_HOST_UNAVAILABLE", "host temporarily unavailable"),
    ("LINK_TOO_MANY_DOWNLOADS", "too many concurrent downloads"),
    ("LINK_HOST_FULL", "host servers are full, try again later"),
    ("LINK_HOST_LIMIT_REACHED", "host traffic limit reached"),
    ("MUST_BE_PREMIUM", "premium account required"),
    ("FREE_TRIAL_LIMIT_REACHED", "free trial limit reached"),
];

/// RealDebrid `error_code` values.
const REALDEBRID_ERRORS: &[(i64, &str)] = &[
    (1, "Bad request"),
    (2, "Unsupported hoster"),
    (3, "Temporarily unavailable"),
    (4, "File not found"),
    (5, "Too many requests"),
    (6, "Access denied"),
    (8, "Not premium account"),
    (9, "No traffic left"),
    (11, "Internal error"),
    (20, "Premium account only"),
];

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(super) async fn alldebrid_unlock(
    client: &Client,
    base: &str,
    agent: &str,
    api_key: &str,
    link: &str,
    timeout: Duration,
) -> Result<ResolvedLink, ResolveError> {
    let response = client
        .get(format!("{}/link/unlock", base))
        .query(&[("agent", agent), ("apikey", api_key), ("link", link)])
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| ResolveError::Network { provider: Provider::AllDebrid, source })?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|source| ResolveError::Network { provider: Provider::AllDebrid, source })?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

    if str_field(&body, "status") == Some("success") {
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let url = str_field(&data, "link")
            .or_else(|| str_field(&data, "download"))
            .or_else(|| str_field(&data, "streamingLink"));
        if let Some(url) = url {
            return Ok(ResolvedLink {
                url: url.to_string(),
                filename: str_field(&data, "filename").map(str::to_string),
                size: u64_field(&data, "filesize"),
                provider: Provider::AllDebrid,
            });
        }
        return Err(ResolveError::LinkNotFound { provider: Provider::AllDebrid });
    }

    Err(ResolveError::Rejected(alldebrid_message(status, &body)))
}

fn alldebrid_message(status: StatusCode, body: &Value) -> String {
    let error = body.get("error");
    let code = error.and_then(|e| str_field(e, "code"));
    if let Some(friendly) = code.and_then(|c| ALLDEBRID_ERRORS.iter().find(|(k, _)| *k == c)) {
        return format!("AD: {}", friendly.1);
    }
    match error.and_then(|e| str_field(e, "message")) {
        Some(message) => format!("AD: {}", message),
        None if !status.is_success() => format!("AD: unexpected response (HTTP {})", status.as_u16()),
        None => "AD: unlock failed".to_string(),
    }
}

pub(super) async fn realdebrid_unlock(
    client: &Client,
    base: &str,
    api_key: &str,
    link: &str,
    timeout: Duration,
) -> Result<ResolvedLink, ResolveError> {
    let response = client
        .post(format!("{}/unrestrict/link", base))
        .bearer_auth(api_key)
        .form(&[("link", link)])
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| ResolveError::Network { provider: Provider::RealDebrid, source })?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|source| ResolveError::Network { provider: Provider::RealDebrid, source })?;
    let body: Option<Value> = serde_json::from_str(&text).ok();

    if let Some(body) = body.as_ref().filter(|_| status == StatusCode::OK) {
        if let Some(url) = str_field(body, "download") {
            return Ok(ResolvedLink {
                url: url.to_string(),
                filename: str_field(body, "filename").map(str::to_string),
                size: u64_field(body, "filesize"),
                provider: Provider::RealDebrid,
            });
        }
    }

    Err(ResolveError::Rejected(realdebrid_message(status, body.as_ref())))
}

fn realdebrid_message(status: StatusCode, body: Option<&Value>) -> String {
    if let Some(body) = body {
        let code = match body.get("error_code") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        let api_text = str_field(body, "error").map(|text| {
            if text.trim().eq_ignore_ascii_case("hoster_not_free") {
                "Premium account only"
            } else {
                text
            }
        });
        if let Some(code) = code {
            let mapped = REALDEBRID_ERRORS.iter().find(|(c, _)| *c == code).map(|(_, m)| *m);
            return match mapped.or(api_text) {
                Some(text) => format!("RD: {}", text),
                None => format!("RD: error {}", code),
            };
        }
        if let Some(text) = api_text {
            return format!("RD: {}", text);
        }
    }

    match status.as_u16() {
        200 => "RD: no download link in response".to_string(),
        503 => "RD: service unavailable (HTTP 503)".to_string(),
        429 => "RD: too many requests (HTTP 429)".to_string(),
        code if code >= 500 => format!("RD: server error (HTTP {})", code),
        code => format!("RD: unexpected response (HTTP {})", code),
    }
}
