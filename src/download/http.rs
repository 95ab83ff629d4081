// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small HTTP helpers shared by the resolvers, the transfer engine and the
//! presence check.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode};

/// Desktop browser signature used for landing pages and the default header profile.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

static DISPOSITION_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*?=["']?(?:UTF-8'')?([^"';]+)"#).expect("valid filename regex")
});

/// `Content-Length`, read from the header rather than the body size hint
/// (which is zero for HEAD responses).
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Filename announced in `Content-Disposition`, percent-decoded.
pub fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let captured = DISPOSITION_FILENAME.captures(raw)?.get(1)?.as_str().trim();
    let decoded = urlencoding::decode(captured)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| captured.to_string());
    Some(decoded).filter(|name| !name.is_empty())
}

/// True when the response says it is an HTML page.
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Best-effort remote size via HEAD. `None` on any failure.
pub async fn probe_remote_size(client: &Client, url: &str, timeout: Duration) -> Option<u64> {
    let response = client.head(url).timeout(timeout).send().await.ok()?;
    if response.status() != StatusCode::OK {
        return None;
    }
    content_length(response.headers())
}

/// Decode the handful of entities found in form field values.
pub fn html_unescape(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';').filter(|&i| i <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" | "#39" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_disposition_filename_variants() {
        let plain = headers(&[(CONTENT_DISPOSITION, r#"attachment; filename="Foo (USA).zip""#)]);
        assert_eq!(disposition_filename(&plain).as_deref(), Some("Foo (USA).zip"));

        let encoded = headers(&[(CONTENT_DISPOSITION, "attachment; filename*=UTF-8''Pok%C3%A9mon.7z")]);
        assert_eq!(disposition_filename(&encoded).as_deref(), Some("Pokémon.7z"));

        let bare = headers(&[(CONTENT_DISPOSITION, "attachment; filename=game.rar; size=10")]);
        assert_eq!(disposition_filename(&bare).as_deref(), Some("game.rar"));

        assert_eq!(disposition_filename(&headers(&[(CONTENT_DISPOSITION, "inline")])), None);
    }

    #[test]
    fn test_content_length_and_html() {
        let map = headers(&[(CONTENT_LENGTH, "1234"), (CONTENT_TYPE, "text/HTML; charset=utf-8")]);
        assert_eq!(content_length(&map), Some(1234));
        assert!(is_html(&map));
        assert!(!is_html(&headers(&[(CONTENT_TYPE, "application/octet-stream")])));
    }

    #[test]
    fn test_html_unescape() {
        assert_eq!(html_unescape("a&amp;b"), "a&b");
        assert_eq!(html_unescape("&quot;x&quot; &#39;y&#x27;"), "\"x\" 'y'");
        assert_eq!(html_unescape("fish & chips"), "fish & chips");
        assert_eq!(html_unescape("&bogus; &lt;"), "&bogus; <");
        assert_eq!(html_unescape("plain"), "plain");
    }
}
