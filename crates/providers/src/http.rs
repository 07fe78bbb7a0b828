//! HTTP plumbing shared by the vendor transports: error mapping and SSE
//! line buffering.

use tandem_core::classify::normalize_error_message;
use tandem_core::error::ProviderError;
use tracing::warn;

/// Map a transport failure from `reqwest`.
pub(crate) fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Turn a non-success response into a typed error, consuming the body.
pub(crate) async fn error_from_response(
    provider: &str,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    warn!(provider, status, body = %body, "Provider returned error");
    error_from_status(status, retry_after, body)
}

pub(crate) fn error_from_status(
    status: u16,
    retry_after: Option<u64>,
    body: String,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(5),
        },
        401 | 403 => ProviderError::AuthenticationFailed(normalize_error_message(&body)),
        404 => ProviderError::ModelNotFound(normalize_error_message(&body)),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// Whether a JSON payload carries a non-null `error` member.
pub(crate) fn carries_error(payload: &serde_json::Value) -> bool {
    payload.get("error").is_some_and(|e| !e.is_null())
}

/// An in-band error payload found inside an SSE `data:` line.
///
/// The status comes from a numeric `error.code` / `error.status` when the
/// vendor includes one.
pub(crate) fn in_band_error(payload: &serde_json::Value, raw: &str) -> ProviderError {
    let error = payload.get("error").unwrap_or(payload);
    let status = error
        .get("code")
        .or_else(|| error.get("status"))
        .and_then(|c| {
            c.as_u64()
                .or_else(|| c.as_str().and_then(|s| s.parse::<u64>().ok()))
        })
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    ProviderError::ApiError {
        status_code: status,
        message: raw.to_string(),
    }
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered raw and decoded one complete line at a time, so a
/// multi-byte character split across network chunks survives intact.
#[derive(Default)]
pub(crate) struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    /// Feed bytes; returns every complete `data:` payload, trimmed.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Blank separators, comments, and `event:` lines carry nothing we need
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_handles_split_lines() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"event: message\ndata: {\"a\"").is_empty());
        assert_eq!(sse.push(b":1}\r\n\n: keepalive\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn sse_buffer_keeps_characters_split_across_chunks() {
        let line = "data: {\"t\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut sse = SseBuffer::default();
        assert!(sse.push(&line[..split]).is_empty());
        let payloads = sse.push(&line[split..]);
        assert_eq!(payloads, vec![r#"{"t":"héllo"}"#]);
        assert!(!payloads[0].contains('\u{FFFD}'));
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_from_status(429, Some(30), String::new()),
            ProviderError::RateLimited { retry_after_secs: 30 }
        ));
        assert!(matches!(
            error_from_status(401, None, r#"{"error":{"message":"bad key"}}"#.into()),
            ProviderError::AuthenticationFailed(m) if m == "bad key"
        ));
        assert!(matches!(
            error_from_status(404, None, "no such model".into()),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            error_from_status(503, None, "overloaded".into()),
            ProviderError::ApiError { status_code: 503, .. }
        ));
    }

    #[test]
    fn in_band_error_reads_numeric_code() {
        let raw = r#"{"error":{"code":502,"message":"upstream died"}}"#;
        let payload: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            in_band_error(&payload, raw),
            ProviderError::ApiError { status_code: 502, .. }
        ));

        let raw = r#"{"error":{"code":"rate_limit_exceeded","message":"slow down"}}"#;
        let payload: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            in_band_error(&payload, raw),
            ProviderError::ApiError { status_code: 0, .. }
        ));
    }
}
