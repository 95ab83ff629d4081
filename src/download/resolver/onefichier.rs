// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Authenticated locker API: metadata, then a one-shot download token.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{ResolveError, ResolvedLink};
use crate::download::types::Provider;

/// Known API messages and what to tell the user.
const MESSAGE_TABLE: &[(&str, &str)] = &[
    ("Bad token", "1F: invalid credential (API key rejected)"),
    ("Must be a customer (Premium, Access) #236", "1F: premium account required"),
];

fn network(source: reqwest::Error) -> ResolveError {
    ResolveError::Network { provider: Provider::OneFichier, source }
}

fn api_message(body: &Value) -> Option<&str> {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
}

/// Friendly text for a non-200 answer. Never retried.
fn rejection(status: StatusCode, body: &Value) -> ResolveError {
    let raw = api_message(body);
    if let Some(friendly) = raw.and_then(|m| {
        MESSAGE_TABLE
            .iter()
            .find(|(known, _)| *known == m)
            .map(|(_, friendly)| *friendly)
    }) {
        return ResolveError::Rejected(friendly.to_string());
    }

    let message = match status.as_u16() {
        401 => "1F: unauthorized (HTTP 401)".to_string(),
        403 => "1F: access denied (HTTP 403)".to_string(),
        429 => "1F: rate limited, try again later (HTTP 429)".to_string(),
        code if code >= 500 => format!("1F: server error (HTTP {})", code),
        code => match raw {
            Some(m) => format!("1F: {} (HTTP {})", m, code),
            None => format!("1F: unexpected response (HTTP {})", code),
        },
    };
    ResolveError::Rejected(message)
}

async fn call(
    client: &Client,
    url: String,
    api_key: &str,
    link: &str,
    timeout: Duration,
) -> Result<(StatusCode, Value), ResolveError> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(&json!({ "url": link, "pretty": 1 }))
        .timeout(timeout)
        .send()
        .await
        .map_err(network)?;
    let status = response.status();
    let text = response.text().await.map_err(network)?;
    let body = serde_json::from_str(&text).unwrap_or(Value::Null);
    Ok((status, body))
}

fn size_of(body: &Value) -> Option<u64> {
    match body.get("size")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(super) async fn resolve(
    client: &Client,
    base: &str,
    api_key: &str,
    link: &str,
    display_name: &str,
    timeout: Duration,
) -> Result<ResolvedLink, ResolveError> {
    let (status, info) = call(client, format!("{}/file/info.cgi", base), api_key, link, timeout).await?;
    if status != StatusCode::OK {
        return Err(rejection(status, &info));
    }
    if info.get("error").and_then(Value::as_str) == Some("Resource not found") {
        return Err(ResolveError::Rejected(format!("1F: file not found: {}", display_name)));
    }

    let filename = info
        .get("filename")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ResolveError::Rejected("1F: could not determine the file name".to_string()))?
        .to_string();
    let size = size_of(&info);
    tracing::debug!(target: "download::resolver", "1F metadata: {} ({:?} bytes)", filename, size);

    let (status, token) =
        call(client, format!("{}/download/get_token.cgi", base), api_key, link, timeout).await?;
    if status != StatusCode::OK {
        return Err(rejection(status, &token));
    }
    let url = token
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ResolveError::Rejected("1F: no download URL in token response".to_string()))?;

    Ok(ResolvedLink {
        url: url.to_string(),
        filename: Some(filename),
        size,
        provider: Provider::OneFichier,
    })
}
