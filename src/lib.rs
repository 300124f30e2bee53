//! `llm-resilience` - a resilience layer for LLM agent chat clients.
//!
//! This library sits between a chat-style caller and an unreliable remote
//! endpoint. It does not implement the transport; it wraps one and handles
//! the frustrating parts of talking to it:
//!
//! - [`classify`]: maps raw transport failures to structured [`AgentError`]s
//!   with a category, retryability, and a suggested retry delay.
//! - [`retry`]: retry-with-backoff orchestration for one logical operation,
//!   with per-call attempt bookkeeping and cooperative cancellation.
//! - [`connection`]: an explicit connection state machine with an ordered
//!   change-event stream, driven by network reachability and send outcomes.
//! - [`queue`]: a durable per-agent FIFO of undelivered message batches,
//!   persisted through a pluggable [`QueueStore`].
//! - [`client`]: [`ResilientAgentClient`], which composes the above so that
//!   requests made while offline are queued and replayed in order once
//!   connectivity returns.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use llm_resilience::{
//!     ChatMessage, ClientError, ConnectionMonitor, ManualNetworkSignal,
//!     MemoryQueueStore, OfflineMessageQueue, OfflineQueueConfig,
//!     ResilientAgentClient,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(MemoryQueueStore::new());
//! let queue = Arc::new(OfflineMessageQueue::load(store, OfflineQueueConfig::default()).await?);
//! let monitor = ConnectionMonitor::new();
//! let signal = ManualNetworkSignal::new(true);
//! monitor.watch_signal(&signal);
//!
//! let client = ResilientAgentClient::new("assistant", transport, queue, monitor);
//! let cancel = CancellationToken::new();
//! match client.complete(vec![ChatMessage::user("hello")], &cancel).await {
//!     Ok(completion) => println!("{completion}"),
//!     Err(ClientError::Offline { id, .. }) => println!("queued as {id}"),
//!     Err(err) => eprintln!("{err}"),
//! }
//! ```

pub mod classify;
pub mod client;
pub mod connection;
pub mod error;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transport;

pub use classify::{classify, classify_http_status, parse_retry_after};
pub use client::ResilientAgentClient;
pub use connection::{
    ConnectionMonitor, ConnectionState, ConnectionStateChanged, ManualNetworkSignal, NetworkSignal,
};
pub use error::{AgentError, ClientError, ErrorCategory, OperationError};
pub use queue::{
    AttemptOutcome, OfflineMessageQueue, OfflineQueueConfig, OverflowPolicy, QueueError,
    QueuedMessage,
};
pub use retry::{RetryContext, RetryPolicy, RetryPolicyOptions};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore, StoreError};
pub use transport::{ChatMessage, ChatTransport, MessageRole, TransportError, UpdateStream};
