//! Error classification for the fallback decision.
//!
//! Vendors report the same failure in many shapes: typed HTTP statuses,
//! JSON bodies, free-form SDK strings. Everything funnels through
//! `classify_error` / `classify_message` so the turn engine only asks one
//! question: is this worth a second attempt on another provider?

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};

/// How a provider failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport failures, rate limiting, overload and 5xx responses.
    Retryable,
    /// Bad requests, rejected auth, content policy. Never retried.
    Permanent,
    /// Bad or missing credentials, unknown model. Fatal.
    Configuration,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Retryable
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Permanent => write!(f, "permanent"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

const RETRYABLE_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "connection closed",
    "etimedout",
    "timed out",
    "timeout",
    "socket hang up",
    "socket",
    "network",
    "fetch failed",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "overloaded",
    "resource_exhausted",
    "resource exhausted",
    "service unavailable",
    "temporarily unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
    "try again later",
];

const CREDENTIAL_WORDS: &[&str] = &["api key", "api_key", "apikey", "x-api-key"];
const CREDENTIAL_PROBLEMS: &[&str] = &["invalid", "missing", "not valid", "incorrect", "malformed"];
const MODEL_PROBLEMS: &[&str] = &[
    "model not found",
    "unknown model",
    "invalid model",
    "model does not exist",
    "does not exist or you do not have access",
    "model_not_found",
    "is not supported for generatecontent",
];

/// Classify a typed provider error.
pub fn classify_error(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::Network(_)
        | ProviderError::Timeout(_)
        | ProviderError::RateLimited { .. }
        | ProviderError::StreamInterrupted(_) => ErrorClass::Retryable,
        ProviderError::ApiError {
            status_code,
            message,
        } => match *status_code {
            408 | 429 | 529 | 500..=599 => ErrorClass::Retryable,
            401 | 403 => ErrorClass::Permanent,
            _ => classify_message(message),
        },
        ProviderError::AuthenticationFailed(_) | ProviderError::InvalidOutput(_) => {
            ErrorClass::Permanent
        }
        ProviderError::ModelNotFound(_) | ProviderError::NotConfigured(_) => {
            ErrorClass::Configuration
        }
    }
}

/// Classify a free-form vendor error message.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    let credential_problem = CREDENTIAL_WORDS.iter().any(|w| lower.contains(w))
        && CREDENTIAL_PROBLEMS.iter().any(|p| lower.contains(p));
    if credential_problem || MODEL_PROBLEMS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Configuration;
    }

    if RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) || has_retryable_status(&lower) {
        return ErrorClass::Retryable;
    }

    ErrorClass::Permanent
}

/// Finds a 5xx / 429 status code that reads like a status, not like a count.
fn has_retryable_status(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i - start != 3 {
            continue;
        }
        let Ok(code) = lower[start..i].parse::<u16>() else {
            continue;
        };
        if !(code == 429 || (500..=599).contains(&code)) {
            continue;
        }
        let context = String::from_utf8_lossy(&bytes[start.saturating_sub(16)..start]);
        if start == 0 || context.contains("status") || context.contains("http") || context.contains("code") {
            return true;
        }
    }
    false
}

/// Reduce a vendor error body to a single readable line.
///
/// JSON bodies (`{"error":{"message":…}}`, `{"error":"…"}`, `{"message":…}`)
/// are unwrapped; surrounding whitespace and a leading `Error:` are dropped.
pub fn normalize_error_message(raw: &str) -> String {
    let trimmed = raw.trim();

    let extracted = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error").filter(|e| e.is_string()))
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| trimmed.to_string());

    let without_prefix = extracted
        .strip_prefix("Error:")
        .map(str::trim_start)
        .unwrap_or(&extracted);

    let collapsed = without_prefix.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > 500 {
        let cut: String = collapsed.chars().take(500).collect();
        format!("{cut}…")
    } else if collapsed.is_empty() {
        "unknown provider error".into()
    } else {
        collapsed
    }
}

/// One-line description of a typed provider error, with vendor bodies unwrapped.
pub fn describe_provider_error(error: &ProviderError) -> String {
    match error {
        ProviderError::ApiError {
            status_code,
            message,
        } => format!("{} (status {status_code})", normalize_error_message(message)),
        other => normalize_error_message(&other.to_string()),
    }
}
