//! Terminal sink for at-least-once events that ran out of attempts.
//!
//! Without a handler, exhaustion is logged at `error` and the event is
//! dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event whose retries were exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: String,
    pub procedure: String,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

/// Receives exhausted events.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync + 'static {
    async fn on_dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

/// Collects dead letters in memory.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    letters: std::sync::Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything collected so far.
    pub fn drain(&self) -> Vec<DeadLetter> {
        match self.letters.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        match self.letters.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterHandler for DeadLetterQueue {
    async fn on_dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()> {
        match self.letters.lock() {
            Ok(mut guard) => guard.push(letter),
            Err(poisoned) => poisoned.into_inner().push(letter),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_collects_and_drains() {
        let queue = DeadLetterQueue::new();
        queue
            .on_dead_letter(DeadLetter {
                event_id: "evt-1".into(),
                procedure: "orders.placed".into(),
                attempts: 5,
                first_attempt_at: Utc::now(),
                last_error: "smtp down".into(),
            })
            .await
            .unwrap();

        assert_eq!(queue.len(), 1);
        let letters = queue.drain();
        assert_eq!(letters[0].event_id, "evt-1");
        assert!(queue.is_empty());
    }
}
