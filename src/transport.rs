//! The transport seam the resilience layer wraps.
//!
//! A [`ChatTransport`] is anything capable of turning a list of role-tagged
//! messages into a completion, either in one shot or as a stream of
//! incremental text updates. This crate never implements the transport; it
//! wraps one and interprets its raw failures.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Role tag for a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions framing the conversation.
    System,
    /// Input from the human side.
    User,
    /// A previous completion from the endpoint.
    Assistant,
}

/// A single role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who authored the message.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
}

impl ChatMessage {
    /// Creates a new message.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Raw failures a transport can produce.
///
/// These are the inputs to [`classify`](crate::classify::classify); the
/// resilience layer never matches on them directly.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The in-flight request was cancelled.
    ///
    /// Transports may surface this without an active cancellation request
    /// (a generic "task canceled" from the runtime); the classifier treats
    /// that case as a timeout.
    #[error("request cancelled")]
    Cancelled,

    /// The request did not complete within the transport's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Low-level connection failure.
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// The request or response payload could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A non-success HTTP status, with the response body and any
    /// `retry-after` header the transport already parsed.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code of the response.
        status: u16,
        /// Response body text.
        body: String,
        /// Header-derived retry delay, when present.
        retry_after: Option<Duration>,
    },

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// A lazy, finite, non-restartable sequence of incremental text updates.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An endpoint capable of producing completions for role-tagged messages.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Produces a single full completion.
    async fn complete_once(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;

    /// Produces a lazy stream of incremental text updates.
    ///
    /// The stream is finite and cannot be restarted. Implementations should
    /// observe `cancel` at each yield point.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<UpdateStream, TransportError>;
}
