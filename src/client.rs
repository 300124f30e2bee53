//! The resilient client: composition of classifier, retry, connection
//! monitor, and offline queue around one transport.
//!
//! [`ResilientAgentClient`] wraps a [`ChatTransport`] for one named agent.
//! Requests made while offline are queued instead of attempted; once the
//! connection is back, previously queued batches are redelivered strictly
//! oldest-first before the new request is issued. Transient failures go
//! through [`RetryPolicy`]; terminal connection-loss failures queue the
//! request and surface as [`ClientError::Offline`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionMonitor;
use crate::error::{ClientError, OperationError};
use crate::queue::{AttemptOutcome, OfflineMessageQueue, QueueError, QueuedMessage};
use crate::retry::{RetryPolicy, RetryPolicyOptions};
use crate::transport::{ChatMessage, ChatTransport, TransportError, UpdateStream};

/// Wraps one [`ChatTransport`] for one named agent.
///
/// The queue and monitor are injected, explicitly owned instances; sharing
/// them across clients (one queue per application, one monitor per link) is
/// the expected shape.
pub struct ResilientAgentClient {
    agent_name: String,
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
    drain_retry: RetryPolicy,
    monitor: ConnectionMonitor,
    queue: Arc<OfflineMessageQueue>,
}

impl ResilientAgentClient {
    /// Creates a client with the default retry options.
    pub fn new(
        agent_name: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        queue: Arc<OfflineMessageQueue>,
        monitor: ConnectionMonitor,
    ) -> Self {
        let options = RetryPolicyOptions::default();
        Self {
            agent_name: agent_name.into(),
            transport,
            drain_retry: drain_policy(&options),
            retry: RetryPolicy::new(options),
            monitor,
            queue,
        }
    }

    /// Overrides the retry options.
    pub fn with_retry_options(mut self, options: RetryPolicyOptions) -> Self {
        self.drain_retry = drain_policy(&options);
        self.retry = RetryPolicy::new(options);
        self
    }

    /// The agent this client sends to.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// The connection monitor this client drives.
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Sends a message batch and returns the completion.
    ///
    /// While offline the batch is queued and [`ClientError::Offline`] is
    /// returned without touching the transport. While online, queued batches
    /// for this agent are redelivered oldest-first before the new request is
    /// issued; a redelivery failure stops the drain but does not block the
    /// new request.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        if !self.monitor.is_online() {
            let entry = self.queue.enqueue(&self.agent_name, messages).await?;
            debug!(
                target: "llm_resilience::client",
                agent = %self.agent_name,
                id = %entry.id,
                event = "queued_offline",
                "connection is down; message batch queued"
            );
            return Err(self.offline_error(&entry));
        }

        self.drain_queue(cancel).await?;

        let result = self
            .retry
            .execute(cancel, || self.transport.complete_once(&messages, cancel))
            .await;
        match result {
            Ok(completion) => {
                self.monitor.record_success();
                Ok(completion)
            }
            Err(OperationError::Cancelled) => Err(ClientError::Cancelled),
            Err(OperationError::Failed { error, attempts }) => {
                if error.category.is_connection_loss() {
                    self.monitor.record_network_failure(&error.message);
                    let entry = self.queue.enqueue(&self.agent_name, messages).await?;
                    warn!(
                        target: "llm_resilience::client",
                        agent = %self.agent_name,
                        id = %entry.id,
                        category = %error.category,
                        event = "send_failed_queued",
                        "send failed with a connection loss; message batch queued"
                    );
                    Err(self.offline_error(&entry))
                } else {
                    Err(ClientError::Operation { error, attempts })
                }
            }
        }
    }

    /// Sends a message batch and returns a lazy stream of incremental text
    /// updates.
    ///
    /// Admission works exactly as in [`complete`](Self::complete): offline
    /// batches are queued, the queue is drained first, and a connection-loss
    /// failure while establishing the stream queues the batch. Once
    /// established, the stream yields updates as they arrive and terminates
    /// with a final [`TransportError::Cancelled`] item if `cancel` fires. No
    /// queue state is written after establishment, so cancelling the stream
    /// never leaves a half-written queue.
    pub async fn complete_streaming(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<UpdateStream, ClientError> {
        if !self.monitor.is_online() {
            let entry = self.queue.enqueue(&self.agent_name, messages).await?;
            debug!(
                target: "llm_resilience::client",
                agent = %self.agent_name,
                id = %entry.id,
                event = "queued_offline",
                "connection is down; message batch queued"
            );
            return Err(self.offline_error(&entry));
        }

        self.drain_queue(cancel).await?;

        let result = self
            .retry
            .execute(cancel, || {
                self.transport.complete_streaming(&messages, cancel)
            })
            .await;
        match result {
            Ok(stream) => {
                self.monitor.record_success();
                Ok(guard_stream(stream, cancel.clone()))
            }
            Err(OperationError::Cancelled) => Err(ClientError::Cancelled),
            Err(OperationError::Failed { error, attempts }) => {
                if error.category.is_connection_loss() {
                    self.monitor.record_network_failure(&error.message);
                    let entry = self.queue.enqueue(&self.agent_name, messages).await?;
                    Err(self.offline_error(&entry))
                } else {
                    Err(ClientError::Operation { error, attempts })
                }
            }
        }
    }

    /// Redelivers queued batches for this agent, oldest first.
    ///
    /// Each entry gets one best-effort attempt; the first failure stops the
    /// drain so later entries never jump the line. Entries settled by a
    /// concurrent call are skipped.
    async fn drain_queue(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        loop {
            let Some(entry) = self.queue.peek_for_agent(&self.agent_name).await else {
                return Ok(());
            };

            let result = self
                .drain_retry
                .execute(cancel, || {
                    self.transport.complete_once(&entry.messages, cancel)
                })
                .await;
            match result {
                Ok(_) => {
                    debug!(
                        target: "llm_resilience::client",
                        agent = %self.agent_name,
                        id = %entry.id,
                        event = "redelivered",
                        "queued message batch redelivered"
                    );
                    match self.queue.mark_delivered(entry.id).await {
                        Ok(()) => {}
                        Err(QueueError::NotFound { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(OperationError::Cancelled) => return Err(ClientError::Cancelled),
                Err(OperationError::Failed { error, .. }) => {
                    if error.category.is_connection_loss() {
                        self.monitor.record_network_failure(&error.message);
                    }
                    match self.queue.record_failed_attempt(entry.id).await {
                        Ok(AttemptOutcome::Expired(expired)) => {
                            warn!(
                                target: "llm_resilience::client",
                                agent = %self.agent_name,
                                id = %expired.id,
                                event = "redelivery_expired",
                                "queued message batch expired during redelivery"
                            );
                        }
                        Ok(AttemptOutcome::Requeued(_)) => {}
                        Err(QueueError::NotFound { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                    return Ok(());
                }
            }
        }
    }

    fn offline_error(&self, entry: &QueuedMessage) -> ClientError {
        ClientError::Offline {
            agent: self.agent_name.clone(),
            id: entry.id,
        }
    }
}

/// Forwards `stream` through a bounded channel, ending it with a final
/// [`TransportError::Cancelled`] item when `cancel` fires.
fn guard_stream(stream: UpdateStream, cancel: CancellationToken) -> UpdateStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(TransportError::Cancelled)).await;
                    break;
                }
                item = stream.next() => match item {
                    Some(update) => {
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

fn drain_policy(options: &RetryPolicyOptions) -> RetryPolicy {
    RetryPolicy::new(RetryPolicyOptions {
        max_retries: 0,
        ..options.clone()
    })
}
