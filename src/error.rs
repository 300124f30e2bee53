//! Error types for the resilience layer.
//!
//! The taxonomy keeps three terminal outcomes distinct so callers can react
//! differently to each: [`ClientError::Operation`] ("gave up after retries"),
//! [`ClientError::Offline`] ("queued for redelivery once connectivity
//! returns"), and plain cancellation, which is never wrapped.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueError;

/// Returns the current Unix timestamp in seconds.
pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time should be after UNIX_EPOCH")
        .as_secs()
}

/// Classified failure categories.
///
/// The set is closed: the classifier maps every raw transport failure into
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// The caller requested cancellation.
    Cancelled,
    /// The endpoint did not answer in time.
    Timeout,
    /// Low-level connection failure (refused, reset, unreachable).
    Network,
    /// The payload could not be serialized or parsed.
    Serialization,
    /// The endpoint rejected the request as malformed.
    BadRequest,
    /// Missing or invalid credentials.
    Authentication,
    /// The requested model does not exist at the endpoint.
    ModelNotFound,
    /// The endpoint is rate limiting this client.
    RateLimit,
    /// The endpoint failed internally.
    ServerError,
    /// The endpoint is temporarily unavailable.
    ServiceUnavailable,
    /// The request exceeded the model's context window.
    ContextLengthExceeded,
    /// The request was rejected by a content policy.
    ContentPolicy,
    /// Anything the classifier does not recognize.
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category are eligible for automatic retry.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::RateLimit
                | ErrorCategory::ServerError
                | ErrorCategory::ServiceUnavailable
        )
    }

    /// Whether terminal exhaustion of this category means the link is down
    /// rather than the request being rejected.
    ///
    /// Connection-loss failures are queued for redelivery and surface as
    /// [`ClientError::Offline`]; everything else terminal surfaces as
    /// [`ClientError::Operation`].
    pub fn is_connection_loss(self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A classified agent failure.
///
/// Immutable value produced by [`classify`](crate::classify::classify);
/// carried inside [`OperationError`] and [`ClientError`] once an operation
/// gives up.
#[derive(Debug, Clone)]
pub struct AgentError {
    /// Failure category.
    pub category: ErrorCategory,
    /// Human-readable description.
    pub message: String,
    /// Raw detail for diagnostics (response body, source error text).
    pub technical_details: Option<String>,
    /// Whether the retry layer may attempt this operation again.
    pub is_retryable: bool,
    /// Server-dictated delay before the next attempt, when known.
    pub retry_after: Option<Duration>,
    /// A hint the embedding UI can show to the user.
    pub actionable_guidance: Option<String>,
    /// HTTP status code, for failures that crossed an HTTP boundary.
    pub http_status_code: Option<u16>,
    /// Unix timestamp (seconds) of when the failure was observed.
    pub occurred_at: u64,
}

impl AgentError {
    /// Creates an error with the category's default retryability.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            technical_details: None,
            is_retryable: category.default_retryable(),
            retry_after: None,
            actionable_guidance: None,
            http_status_code: None,
            occurred_at: current_unix_timestamp(),
        }
    }

    /// Attaches raw diagnostic detail.
    pub fn with_technical_details(mut self, details: impl Into<String>) -> Self {
        self.technical_details = Some(details.into());
        self
    }

    /// Attaches a server-dictated retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Attaches user-facing guidance.
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.actionable_guidance = Some(guidance.into());
        self
    }

    /// Attaches the HTTP status code the failure was derived from.
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status_code = Some(status);
        self
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)?;
        if let Some(status) = self.http_status_code {
            write!(f, " (HTTP {status})")?;
        }
        Ok(())
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation met a non-retryable error or exhausted its retry
    /// budget. Carries the final classified error and the total number of
    /// invocations made.
    #[error("operation failed after {attempts} attempt(s): {error}")]
    Failed {
        /// The last classified error.
        error: AgentError,
        /// Total invocations made, including the first attempt.
        attempts: u32,
    },
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

/// Failure surface of [`ResilientAgentClient`](crate::client::ResilientAgentClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request was rejected by the endpoint or exhausted its retries on
    /// a non-connection failure. Nothing was queued.
    #[error("operation failed after {attempts} attempt(s): {error}")]
    Operation {
        /// The last classified error.
        error: AgentError,
        /// Total invocations made, including the first attempt.
        attempts: u32,
    },
    /// The request could not be sent because the connection is down or
    /// failed outright; it was queued for redelivery.
    #[error("agent '{agent}' is offline; message queued as {id}")]
    Offline {
        /// The agent the request was addressed to.
        agent: String,
        /// Id of the queued entry.
        id: Uuid,
    },
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The offline queue could not be read or durably updated.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<OperationError> for ClientError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Failed { error, attempts } => ClientError::Operation { error, attempts },
            OperationError::Cancelled => ClientError::Cancelled,
        }
    }
}
