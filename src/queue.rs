//! Durable per-agent FIFO of undelivered message batches.
//!
//! The queue is the one shared mutable resource of the resilience layer:
//! every mutation (enqueue, mark delivered, record failed attempt) funnels
//! through a single `tokio::sync::Mutex` and durably updates the backing
//! [`QueueStore`](crate::store::QueueStore) before returning, so a process
//! restart loses and reorders nothing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::current_unix_timestamp;
use crate::store::{QueueStore, StoreError};
use crate::transport::ChatMessage;

/// Default number of delivery attempts before an entry expires.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Failures from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is full and the overflow policy rejects new entries.
    #[error("offline queue is at capacity ({capacity} entries)")]
    CapacityExceeded {
        /// Configured capacity.
        capacity: usize,
    },

    /// No entry with the given id.
    #[error("queued message {id} not found")]
    NotFound {
        /// The id that was looked up.
        id: Uuid,
    },

    /// The backing store failed; the operation did not take effect.
    #[error("queue storage failed: {0}")]
    Storage(#[from] StoreError),

    /// A queue record could not be encoded or decoded.
    #[error("failed to encode queued message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What to do when an enqueue would exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail the enqueue with [`QueueError::CapacityExceeded`].
    #[default]
    RejectNewest,
    /// Evict the oldest entry to make room.
    DropOldest,
}

/// Configuration for [`OfflineMessageQueue`].
#[derive(Debug, Clone)]
pub struct OfflineQueueConfig {
    /// Maximum number of queued entries across all agents.
    pub capacity: usize,
    /// Delivery attempts granted to each new entry.
    pub default_max_attempts: u32,
    /// Behavior when an enqueue would exceed `capacity`.
    pub overflow: OverflowPolicy,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// An undelivered message batch awaiting redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique id, generated at enqueue time.
    pub id: Uuid,
    /// The agent the batch is addressed to.
    pub agent_name: String,
    /// The request payload.
    pub messages: Vec<ChatMessage>,
    /// Redelivery attempts made so far.
    pub attempt_count: u32,
    /// Attempts allowed before the entry expires.
    pub max_attempts: u32,
    /// Unix timestamp (seconds) of when the entry was enqueued.
    pub enqueued_at: u64,
    /// Monotonic enqueue order, persisted so FIFO order survives restarts
    /// where second-resolution timestamps would tie.
    pub(crate) sequence: u64,
}

impl QueuedMessage {
    /// Whether the entry has used up its delivery attempts.
    pub fn is_expired(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Outcome of [`OfflineMessageQueue::record_failed_attempt`].
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The entry remains queued with an incremented attempt count.
    Requeued(QueuedMessage),
    /// The entry used up its attempts and was removed.
    Expired(QueuedMessage),
}

struct QueueInner {
    /// Entries ordered by `sequence`, oldest first.
    entries: Vec<QueuedMessage>,
    next_sequence: u64,
}

/// Durable FIFO of undelivered message batches, per agent.
pub struct OfflineMessageQueue {
    store: Arc<dyn QueueStore>,
    config: OfflineQueueConfig,
    inner: Mutex<QueueInner>,
}

impl OfflineMessageQueue {
    /// Opens the queue, restoring any entries persisted in `store`.
    ///
    /// A record that cannot be decoded fails the load: skipping it would
    /// silently lose a message.
    pub async fn load(
        store: Arc<dyn QueueStore>,
        config: OfflineQueueConfig,
    ) -> Result<Self, QueueError> {
        let mut entries = Vec::new();
        for record in store.list_all().await? {
            let entry: QueuedMessage = serde_json::from_str(&record)?;
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.sequence);
        let next_sequence = entries.last().map(|entry| entry.sequence + 1).unwrap_or(1);

        if !entries.is_empty() {
            debug!(
                target: "llm_resilience::queue",
                restored = entries.len(),
                event = "queue_restored",
                "restored persisted queue entries"
            );
        }

        Ok(Self {
            store,
            config,
            inner: Mutex::new(QueueInner {
                entries,
                next_sequence,
            }),
        })
    }

    /// Queues a message batch for later delivery.
    ///
    /// The entry is durably persisted before it becomes visible to `peek`.
    pub async fn enqueue(
        &self,
        agent_name: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<QueuedMessage, QueueError> {
        let mut inner = self.inner.lock().await;

        if inner.entries.len() >= self.config.capacity {
            match self.config.overflow {
                OverflowPolicy::RejectNewest => {
                    return Err(QueueError::CapacityExceeded {
                        capacity: self.config.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = inner.entries.first().cloned() {
                        self.store.delete(&evicted.id.to_string()).await?;
                        inner.entries.remove(0);
                        warn!(
                            target: "llm_resilience::queue",
                            id = %evicted.id,
                            agent = %evicted.agent_name,
                            event = "entry_evicted",
                            "queue at capacity; evicted oldest entry"
                        );
                    }
                }
            }
        }

        let entry = QueuedMessage {
            id: Uuid::new_v4(),
            agent_name: agent_name.to_owned(),
            messages,
            attempt_count: 0,
            max_attempts: self.config.default_max_attempts,
            enqueued_at: current_unix_timestamp(),
            sequence: inner.next_sequence,
        };

        let record = serde_json::to_string(&entry)?;
        self.store.put(&entry.id.to_string(), &record).await?;

        inner.next_sequence += 1;
        inner.entries.push(entry.clone());
        debug!(
            target: "llm_resilience::queue",
            id = %entry.id,
            agent = %entry.agent_name,
            queued = inner.entries.len(),
            event = "entry_queued",
            "message batch queued for redelivery"
        );
        Ok(entry)
    }

    /// Returns the oldest entry across all agents without removing it.
    pub async fn peek(&self) -> Option<QueuedMessage> {
        self.inner.lock().await.entries.first().cloned()
    }

    /// Returns the oldest entry for one agent without removing it.
    pub async fn peek_for_agent(&self, agent_name: &str) -> Option<QueuedMessage> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .find(|entry| entry.agent_name == agent_name)
            .cloned()
    }

    /// Removes a delivered entry.
    pub async fn mark_delivered(&self, id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.entries.iter().position(|entry| entry.id == id) else {
            return Err(QueueError::NotFound { id });
        };
        self.store.delete(&id.to_string()).await?;
        let entry = inner.entries.remove(index);
        debug!(
            target: "llm_resilience::queue",
            id = %entry.id,
            agent = %entry.agent_name,
            event = "entry_delivered",
            "queued message delivered and removed"
        );
        Ok(())
    }

    /// Records a failed redelivery attempt.
    ///
    /// The entry's attempt count is incremented and persisted; an entry that
    /// has used up its attempts is removed and reported as
    /// [`AttemptOutcome::Expired`] instead of being retried indefinitely.
    pub async fn record_failed_attempt(&self, id: Uuid) -> Result<AttemptOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.entries.iter().position(|entry| entry.id == id) else {
            return Err(QueueError::NotFound { id });
        };

        let mut entry = inner.entries[index].clone();
        entry.attempt_count += 1;

        if entry.is_expired() {
            self.store.delete(&entry.id.to_string()).await?;
            inner.entries.remove(index);
            warn!(
                target: "llm_resilience::queue",
                id = %entry.id,
                agent = %entry.agent_name,
                attempts = entry.attempt_count,
                event = "entry_expired",
                "queued message used up its delivery attempts and was dropped"
            );
            Ok(AttemptOutcome::Expired(entry))
        } else {
            let record = serde_json::to_string(&entry)?;
            self.store.put(&entry.id.to_string(), &record).await?;
            inner.entries[index] = entry.clone();
            Ok(AttemptOutcome::Requeued(entry))
        }
    }

    /// Number of queued entries across all agents.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the queue holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// All queued entries for one agent, oldest first.
    pub async fn entries_for_agent(&self, agent_name: &str) -> Vec<QueuedMessage> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.agent_name == agent_name)
            .cloned()
            .collect()
    }
}
