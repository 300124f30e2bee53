//! Maps raw transport failures to classified [`AgentError`]s.
//!
//! The classifier is a set of pure functions: no state, no side effects,
//! deterministic for the same input. The retry layer and the client decide
//! what to do with the classification; nothing here sleeps or retries.

use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorCategory};
use crate::transport::TransportError;

/// Delay stamped on timeout-category errors so the retry layer has a
/// server-agnostic hint even when the endpoint provided none.
const DEFAULT_TIMEOUT_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Body markers that reclassify a 400 as a context-window overflow.
const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "maximum context",
    "token limit",
    "too many tokens",
    "prompt is too long",
];

/// Body markers that reclassify a 400 as a content-policy rejection.
const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content policy",
    "content_policy",
    "content filter",
    "content management policy",
];

/// Classifies a raw transport failure into an [`AgentError`].
///
/// `cancel` disambiguates cancelled failures: a cancellation the caller
/// actually requested classifies as [`ErrorCategory::Cancelled`], while a
/// generic "task canceled" raised with no active cancellation request is
/// treated as a timeout. The latter mapping is preserved for compatibility
/// with the original behavior; it is a heuristic, not an obviously correct
/// choice.
pub fn classify(failure: &TransportError, cancel: &CancellationToken) -> AgentError {
    match failure {
        TransportError::Cancelled => {
            if cancel.is_cancelled() {
                AgentError::new(ErrorCategory::Cancelled, "operation was cancelled")
            } else {
                timeout_error("request was aborted without an active cancellation request")
            }
        }
        TransportError::Timeout(elapsed) => {
            timeout_error(format!("request timed out after {elapsed:?}"))
        }
        TransportError::Io(err) => {
            AgentError::new(ErrorCategory::Network, format!("connection failed: {err}"))
                .with_technical_details(err.to_string())
                .with_guidance("Check network connectivity to the endpoint.")
        }
        TransportError::Serialization(err) => AgentError::new(
            ErrorCategory::Serialization,
            format!("payload could not be serialized: {err}"),
        )
        .with_technical_details(err.to_string()),
        TransportError::HttpStatus {
            status,
            body,
            retry_after,
        } => {
            let mut error = classify_http_status(*status, Some(body.as_str()));
            // Body-derived delay wins; the header fills the gap.
            if error.retry_after.is_none() {
                error.retry_after = *retry_after;
            }
            error
        }
        TransportError::Other(message) => AgentError::new(ErrorCategory::Unknown, message.clone()),
    }
}

/// Classifies an HTTP status code, optionally inspecting the response body.
pub fn classify_http_status(status: u16, body: Option<&str>) -> AgentError {
    let error = match status {
        400 => classify_bad_request(body),
        401 | 403 => AgentError::new(
            ErrorCategory::Authentication,
            "the endpoint rejected the request credentials",
        )
        .with_guidance("Verify the API credentials configured for this agent."),
        404 => AgentError::new(ErrorCategory::ModelNotFound, "the requested model was not found")
            .with_guidance("Check that the requested model name exists and is available."),
        429 => {
            let mut error = AgentError::new(
                ErrorCategory::RateLimit,
                "the endpoint is rate limiting this client",
            )
            .with_guidance("Reduce request frequency or wait before retrying.");
            if let Some(delay) = body.and_then(scan_retry_after_seconds) {
                error = error.with_retry_after(delay);
            }
            error
        }
        500 | 502 => AgentError::new(
            ErrorCategory::ServerError,
            format!("the endpoint failed internally (HTTP {status})"),
        )
        .with_guidance("The remote endpoint is having trouble; retrying usually resolves this."),
        503 => AgentError::new(
            ErrorCategory::ServiceUnavailable,
            "the endpoint is temporarily unavailable",
        )
        .with_guidance("The remote endpoint is having trouble; retrying usually resolves this."),
        504 => timeout_error("the gateway timed out waiting for the endpoint"),
        other if other >= 500 => AgentError::new(
            ErrorCategory::ServerError,
            format!("the endpoint failed (HTTP {other})"),
        ),
        other => AgentError::new(
            ErrorCategory::Unknown,
            format!("unexpected HTTP status {other}"),
        ),
    };

    let error = match body {
        Some(text) if !text.is_empty() => error.with_technical_details(text),
        _ => error,
    };
    error.with_http_status(status)
}

/// Parses a `retry-after` value given as whole seconds.
///
/// Returns `None` for absent, empty, or non-numeric input.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn timeout_error(message: impl Into<String>) -> AgentError {
    AgentError::new(ErrorCategory::Timeout, message)
        .with_retry_after(DEFAULT_TIMEOUT_RETRY_AFTER)
        .with_guidance("The endpoint did not answer in time; it may be overloaded.")
}

fn classify_bad_request(body: Option<&str>) -> AgentError {
    let lowered = body.map(str::to_lowercase).unwrap_or_default();
    if CONTEXT_LENGTH_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        AgentError::new(
            ErrorCategory::ContextLengthExceeded,
            "the request exceeded the model's context window",
        )
        .with_guidance("Shorten the conversation history or reduce the prompt size.")
    } else if CONTENT_POLICY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        AgentError::new(
            ErrorCategory::ContentPolicy,
            "the request was rejected by the endpoint's content policy",
        )
        .with_guidance("Rephrase the request to comply with the provider's content policy.")
    } else {
        AgentError::new(
            ErrorCategory::BadRequest,
            "the endpoint rejected the request as malformed",
        )
        .with_guidance("Inspect the request payload for malformed fields.")
    }
}

/// Scans a response body for a "retry after N seconds" hint.
fn scan_retry_after_seconds(body: &str) -> Option<Duration> {
    let regex = Regex::new(r"(?i)retry\s+after\s+(\d+)\s+seconds?").ok()?;
    let captures = regex.captures(body)?;
    captures
        .get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
