//! Retry-state and deduplication storage.
//!
//! The engine only touches shared delivery state through [`DeliveryStore`].
//! Implementations are expected to serialize concurrent access per key; the
//! engine adds no locking on top.
//!
//! Every method is async so networked stores (Redis, Postgres) fit the same
//! contract as [`InMemoryDeliveryStore`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from delivery storage.
#[derive(Debug)]
pub enum StoreError {
    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "delivery store backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Retry State
// =============================================================================

/// At-least-once bookkeeping for one event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Attempts started so far, including the one in progress.
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn first() -> Self {
        Self {
            attempts: 1,
            first_attempt_at: Utc::now(),
            last_error: None,
        }
    }

    /// The state for the next attempt.
    pub fn next_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

// =============================================================================
// Delivery Store
// =============================================================================

/// Pluggable storage for retry counters and the dedup window.
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    async fn get_retry_state(&self, event_id: &str) -> Result<Option<RetryState>, StoreError>;

    async fn set_retry_state(&self, event_id: &str, state: RetryState) -> Result<(), StoreError>;

    async fn delete_retry_state(&self, event_id: &str) -> Result<(), StoreError>;

    /// True if `event_id` was marked within its window.
    async fn is_duplicate(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Remember `event_id` for `ttl`.
    async fn mark_duplicate(&self, event_id: &str, ttl: Duration) -> Result<(), StoreError>;
}

/// In-memory store for single-process deployments and tests.
///
/// Dedup marks expire lazily on lookup; [`purge_expired`](Self::purge_expired)
/// sweeps the rest. Expiry uses the tokio clock, so paused-time tests can
/// advance past a window.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    retries: DashMap<String, RetryState>,
    dedup: DashMap<String, Instant>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired dedup marks. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.dedup.len();
        self.dedup.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.dedup.len())
    }

    pub fn retry_count(&self) -> usize {
        self.retries.len()
    }

    pub fn dedup_count(&self) -> usize {
        self.dedup.len()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn get_retry_state(&self, event_id: &str) -> Result<Option<RetryState>, StoreError> {
        Ok(self.retries.get(event_id).map(|s| s.clone()))
    }

    async fn set_retry_state(&self, event_id: &str, state: RetryState) -> Result<(), StoreError> {
        self.retries.insert(event_id.to_string(), state);
        Ok(())
    }

    async fn delete_retry_state(&self, event_id: &str) -> Result<(), StoreError> {
        self.retries.remove(event_id);
        Ok(())
    }

    async fn is_duplicate(&self, event_id: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        // remove_if holds the shard lock, so a concurrent mark is not lost.
        self.dedup.remove_if(event_id, |_, expires_at| *expires_at <= now);
        Ok(self.dedup.contains_key(event_id))
    }

    async fn mark_duplicate(&self, event_id: &str, ttl: Duration) -> Result<(), StoreError> {
        self.dedup.insert(event_id.to_string(), Instant::now() + ttl);
        Ok(())
    }
}
