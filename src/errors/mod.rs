// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API error responses
//!
//! Every error returned by the HTTP surface carries:
//! - A short machine-readable `error` kind
//! - A user-facing `message`
//! - A unique `reference` code that also appears in the server log
//!
//! Internal details (paths, provider responses) are logged, never returned.
//! Provider credentials are scrubbed from those log lines first.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6).map(|_| chars[rng.gen_range(0..chars.len())]).collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// CREDENTIAL SCRUBBING
// =============================================================================

static APIKEY_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(apikey|api_key|token)=[^&\s]+").expect("valid regex"));
static BEARER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").expect("valid regex"));

/// Remove provider keys from a message before it is logged.
pub fn scrub_credentials(details: &str) -> String {
    let scrubbed = APIKEY_PARAM.replace_all(details, "$1=[REDACTED]");
    BEARER.replace_all(&scrubbed, "Bearer [REDACTED]").into_owned()
}

// =============================================================================
// API ERRORS
// =============================================================================

/// Errors returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Malformed or incomplete request (400)
    InvalidRequest { message: String, reference: String },

    /// Unknown route or resource (404)
    NotFound { message: String, reference: String },

    /// Ledger or queue failure (500). Details stay in the log.
    Internal { message: String, reference: String },
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    pub reference: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest { .. } => "invalid_request",
            ApiError::NotFound { .. } => "not_found",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. }
            | ApiError::NotFound { reference, .. }
            | ApiError::Internal { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Internal { message, .. } => message,
        }
    }

    /// A 400 with a message the caller can act on.
    pub fn invalid_request(user_message: impl Into<String>) -> Self {
        let reference = generate_reference_code();
        let message = user_message.into();
        tracing::warn!(target: "server", reference = %reference, "Invalid request: {}", message);
        Self::InvalidRequest { message, reference }
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();
        tracing::info!(target: "server", reference = %reference, resource = %resource, "Resource not found");
        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// A 500. `internal_error` is logged, never returned.
    pub fn internal(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(
            target: "server",
            reference = %reference,
            internal_error = %scrub_credentials(internal_error),
            "Internal server error"
        );
        Self::Internal {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(&format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.kind(),
            message: self.message().to_string(),
            reference: self.reference().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
