//! Event delivery engine.
//!
//! The router never invokes an event handler directly. It wraps the
//! interceptor chain in an `execute(ack)` closure and hands it to the
//! [`DeliveryEngine`] together with a guarantee, which decides if, when and
//! how often the closure runs:
//!
//! | guarantee       | behavior                                                      |
//! |-----------------|---------------------------------------------------------------|
//! | `best-effort`   | run once, return the result                                   |
//! | `at-least-once` | run now; on failure retry with back-off up to `max_attempts`  |
//! | `at-most-once`  | skip if the id is marked; otherwise mark, then run once       |
//!
//! For at-least-once, a handler succeeds by returning `Ok` *or* by calling
//! [`Ack::ack`]. Attempt counters live in the [`DeliveryStore`] so a
//! networked store keeps them across restarts.
//!
//! # Retry timers
//!
//! Retries run as background tasks and never block the caller. [`stop`]
//! cancels every pending timer without waiting for executions already in
//! progress. After `stop`, failed attempts are recorded but no new retries
//! are scheduled.
//!
//! [`stop`]: DeliveryEngine::stop

pub mod dead_letter;
pub mod policy;
pub mod store;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use dead_letter::{DeadLetter, DeadLetterHandler, DeadLetterQueue};
pub use policy::{DeliveryGuarantee, RetryPolicy};
pub use store::{DeliveryStore, InMemoryDeliveryStore, RetryState, StoreError};

/// Default at-most-once dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

// =============================================================================
// Ack
// =============================================================================

/// Explicit success signal for event handlers.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Ack {
    acked: Arc<AtomicBool>,
}

impl Ack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm the event was processed. Stops further at-least-once retries
    /// even if the handler then returns an error.
    pub fn ack(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Requests and outcomes
// =============================================================================

/// One run of an event handler, interceptors included.
pub type ExecuteFn = Arc<dyn Fn(Ack) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What to deliver and how.
#[derive(Clone)]
pub struct DeliveryRequest {
    pub event_id: String,
    pub procedure: String,
    pub guarantee: DeliveryGuarantee,
    /// Falls back to the engine default.
    pub retry_policy: Option<RetryPolicy>,
    /// Falls back to the engine default.
    pub dedup_window: Option<Duration>,
    pub execute: ExecuteFn,
}

impl DeliveryRequest {
    pub fn new(
        event_id: impl Into<String>,
        procedure: impl Into<String>,
        guarantee: DeliveryGuarantee,
        execute: ExecuteFn,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            procedure: procedure.into(),
            guarantee,
            retry_policy: None,
            dedup_window: None,
            execute,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }
}

impl std::fmt::Debug for DeliveryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRequest")
            .field("event_id", &self.event_id)
            .field("procedure", &self.procedure)
            .field("guarantee", &self.guarantee)
            .field("retry_policy", &self.retry_policy)
            .field("dedup_window", &self.dedup_window)
            .finish_non_exhaustive()
    }
}

/// How a delivery ended, as far as the caller can see.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The handler succeeded or acked.
    Delivered,
    /// The attempt failed and a retry timer is pending.
    RetryScheduled { attempt: u32, delay: Duration },
    /// The last allowed attempt failed.
    Exhausted { attempts: u32 },
    /// The attempt failed after `stop`; retry state is kept in the store.
    Stopped { attempt: u32 },
    /// At-most-once suppression of a repeated id.
    Duplicate,
}

/// A retry timer that has not fired yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRetry {
    pub event_id: String,
    pub attempt: u32,
    pub delay: Duration,
}

// =============================================================================
// Engine
// =============================================================================

/// Builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
    store: Arc<dyn DeliveryStore>,
    dead_letters: Option<Arc<dyn DeadLetterHandler>>,
    default_policy: RetryPolicy,
    default_dedup_window: Duration,
}

impl DeliveryEngineBuilder {
    pub fn dead_letters(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letters = Some(handler);
        self
    }

    pub fn default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn default_dedup_window(mut self, window: Duration) -> Self {
        self.default_dedup_window = window;
        self
    }

    pub fn build(self) -> DeliveryEngine {
        DeliveryEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                dead_letters: self.dead_letters,
                default_policy: self.default_policy,
                default_dedup_window: self.default_dedup_window,
                shutdown: CancellationToken::new(),
                pending: DashMap::new(),
                next_timer: AtomicU64::new(0),
            }),
        }
    }
}

/// Decides if, when and how often event handlers run.
///
/// Cheap to clone; clones share timers and the store.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn DeliveryStore>,
    dead_letters: Option<Arc<dyn DeadLetterHandler>>,
    default_policy: RetryPolicy,
    default_dedup_window: Duration,
    shutdown: CancellationToken,
    pending: DashMap<u64, PendingRetry>,
    next_timer: AtomicU64,
}

/// A resolved at-least-once delivery, shared by every attempt.
struct RetryJob {
    event_id: String,
    procedure: String,
    policy: RetryPolicy,
    execute: ExecuteFn,
}

impl DeliveryEngine {
    pub fn builder(store: Arc<dyn DeliveryStore>) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder {
            store,
            dead_letters: None,
            default_policy: RetryPolicy::default(),
            default_dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    /// Engine over an [`InMemoryDeliveryStore`] with default policies.
    pub fn in_memory() -> Self {
        Self::builder(Arc::new(InMemoryDeliveryStore::new())).build()
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.inner.store
    }

    /// Run `request` under its guarantee.
    ///
    /// Returns the handler's error for best-effort and at-most-once. For
    /// at-least-once, handler failures are absorbed into the outcome and
    /// only store failures are returned.
    pub async fn deliver(&self, request: DeliveryRequest) -> anyhow::Result<DeliveryOutcome> {
        match request.guarantee {
            DeliveryGuarantee::BestEffort => {
                (request.execute)(Ack::new()).await?;
                Ok(DeliveryOutcome::Delivered)
            }
            DeliveryGuarantee::AtMostOnce => self.deliver_at_most_once(request).await,
            DeliveryGuarantee::AtLeastOnce => {
                let job = Arc::new(RetryJob {
                    event_id: request.event_id,
                    procedure: request.procedure,
                    policy: request
                        .retry_policy
                        .unwrap_or_else(|| self.inner.default_policy.clone()),
                    execute: request.execute,
                });
                run_attempt(Arc::clone(&self.inner), job).await
            }
        }
    }

    async fn deliver_at_most_once(
        &self,
        request: DeliveryRequest,
    ) -> anyhow::Result<DeliveryOutcome> {
        let store = &self.inner.store;
        if store.is_duplicate(&request.event_id).await? {
            debug!(
                event_id = %request.event_id,
                procedure = %request.procedure,
                "duplicate event suppressed"
            );
            return Ok(DeliveryOutcome::Duplicate);
        }

        let window = request
            .dedup_window
            .unwrap_or(self.inner.default_dedup_window);
        store.mark_duplicate(&request.event_id, window).await?;

        (request.execute)(Ack::new()).await?;
        Ok(DeliveryOutcome::Delivered)
    }

    /// Cancel every pending retry timer. Idempotent.
    ///
    /// Executions already running are not awaited.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!(pending = self.inner.pending.len(), "stopping delivery engine");
        }
        self.inner.shutdown.cancel();
        self.inner.pending.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of retry timers that have not fired.
    pub fn pending_retries(&self) -> usize {
        self.inner.pending.len()
    }

    /// Snapshot of pending retry timers.
    pub fn pending(&self) -> Vec<PendingRetry> {
        self.inner
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// One at-least-once attempt. Boxed because retries re-enter it from a
/// spawned task.
fn run_attempt(
    inner: Arc<EngineInner>,
    job: Arc<RetryJob>,
) -> BoxFuture<'static, anyhow::Result<DeliveryOutcome>> {
    Box::pin(async move {
        let state = match inner.store.get_retry_state(&job.event_id).await? {
            Some(previous) => previous.next_attempt(),
            None => RetryState::first(),
        };
        let attempt = state.attempts;
        inner
            .store
            .set_retry_state(&job.event_id, state.clone())
            .await?;

        let ack = Ack::new();
        let result = (job.execute)(ack.clone()).await;

        let error = match result {
            Ok(()) => None,
            Err(_) if ack.is_acked() => None,
            Err(e) => Some(e),
        };

        let Some(error) = error else {
            inner.store.delete_retry_state(&job.event_id).await?;
            if attempt > 1 {
                debug!(event_id = %job.event_id, attempt, "event delivered after retry");
            }
            return Ok(DeliveryOutcome::Delivered);
        };

        let message = format!("{:#}", error);

        if !job.policy.allows_retry_after(attempt) {
            inner.store.delete_retry_state(&job.event_id).await?;
            error!(
                event_id = %job.event_id,
                procedure = %job.procedure,
                attempts = attempt,
                error = %message,
                "event retries exhausted"
            );
            dead_letter(&inner, &job, &state, message).await;
            return Ok(DeliveryOutcome::Exhausted { attempts: attempt });
        }

        let state = RetryState {
            last_error: Some(message.clone()),
            ..state
        };
        inner.store.set_retry_state(&job.event_id, state).await?;

        if inner.shutdown.is_cancelled() {
            debug!(
                event_id = %job.event_id,
                attempt,
                "engine stopped; retry not scheduled"
            );
            return Ok(DeliveryOutcome::Stopped { attempt });
        }

        let delay = job.policy.delay_for(attempt);
        warn!(
            event_id = %job.event_id,
            procedure = %job.procedure,
            attempt,
            max_attempts = job.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "event handler failed, scheduling retry"
        );
        schedule_retry(inner, job, attempt, delay);

        Ok(DeliveryOutcome::RetryScheduled { attempt, delay })
    })
}

fn schedule_retry(inner: Arc<EngineInner>, job: Arc<RetryJob>, attempt: u32, delay: Duration) {
    let timer_id = inner.next_timer.fetch_add(1, Ordering::Relaxed);
    inner.pending.insert(
        timer_id,
        PendingRetry {
            event_id: job.event_id.clone(),
            attempt,
            delay,
        },
    );

    tokio::spawn(async move {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.pending.remove(&timer_id);
                debug!(event_id = %job.event_id, attempt, "retry timer cancelled");
            }
            _ = tokio::time::sleep(delay) => {
                inner.pending.remove(&timer_id);
                let event_id = job.event_id.clone();
                if let Err(e) = run_attempt(inner, job).await {
                    error!(event_id = %event_id, error = %e, "retry attempt failed to run");
                }
            }
        }
    });
}

async fn dead_letter(inner: &EngineInner, job: &RetryJob, state: &RetryState, last_error: String) {
    let Some(handler) = &inner.dead_letters else {
        return;
    };

    let letter = DeadLetter {
        event_id: job.event_id.clone(),
        procedure: job.procedure.clone(),
        attempts: state.attempts,
        first_attempt_at: state.first_attempt_at,
        last_error,
    };
    if let Err(e) = handler.on_dead_letter(letter).await {
        error!(event_id = %job.event_id, error = %e, "dead-letter handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then succeeds. Records call times.
    fn flaky(failures: u32, calls: Arc<Mutex<Vec<Instant>>>) -> ExecuteFn {
        let counter = Arc::new(AtomicU32::new(0));
        Arc::new(move |_ack: Ack| -> BoxFuture<'static, anyhow::Result<()>> {
            let counter = counter.clone();
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(Instant::now());
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    anyhow::bail!("attempt {} failed", n + 1);
                }
                Ok(())
            })
        })
    }

    fn always_fail(calls: Arc<AtomicU32>) -> ExecuteFn {
        Arc::new(move |_ack: Ack| -> BoxFuture<'static, anyhow::Result<()>> {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still broken")
            })
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_best_effort_runs_once_and_returns_error() {
        let engine = DeliveryEngine::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let request = DeliveryRequest::new(
            "evt-1",
            "audit.log",
            DeliveryGuarantee::BestEffort,
            always_fail(calls.clone()),
        );

        assert!(engine.deliver(request).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_least_once_retries_after_initial_delay() {
        let engine = DeliveryEngine::in_memory();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let request = DeliveryRequest::new(
            "evt-2",
            "orders.placed",
            DeliveryGuarantee::AtLeastOnce,
            flaky(1, calls.clone()),
        )
        .with_retry_policy(fast_policy(3));

        let outcome = engine.deliver(request).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(engine.pending_retries(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_millis(100));
        assert_eq!(engine.pending_retries(), 0);
        assert!(engine
            .store()
            .get_retry_state("evt-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ack_counts_as_success_even_with_error() {
        let engine = DeliveryEngine::in_memory();
        let execute: ExecuteFn = Arc::new(|ack: Ack| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async move {
                ack.ack();
                anyhow::bail!("cleanup failed after processing")
            })
        });
        let request = DeliveryRequest::new(
            "evt-3",
            "orders.placed",
            DeliveryGuarantee::AtLeastOnce,
            execute,
        );

        assert_eq!(
            engine.deliver(request).await.unwrap(),
            DeliveryOutcome::Delivered
        );
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reaches_dead_letters() {
        let queue = Arc::new(DeadLetterQueue::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let engine = DeliveryEngine::builder(store.clone())
            .dead_letters(queue.clone())
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        let request = DeliveryRequest::new(
            "evt-4",
            "mail.send",
            DeliveryGuarantee::AtLeastOnce,
            always_fail(calls.clone()),
        )
        .with_retry_policy(fast_policy(3));

        engine.deliver(request).await.unwrap();
        // 100ms + 200ms of back-off, plus slack.
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let letters = queue.drain();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event_id, "evt-4");
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].last_error, "still broken");
        assert_eq!(store.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_exhausts_immediately() {
        let engine = DeliveryEngine::in_memory();
        let request = DeliveryRequest::new(
            "evt-5",
            "mail.send",
            DeliveryGuarantee::AtLeastOnce,
            always_fail(Arc::new(AtomicU32::new(0))),
        )
        .with_retry_policy(fast_policy(1));

        assert_eq!(
            engine.deliver(request).await.unwrap(),
            DeliveryOutcome::Exhausted { attempts: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_once_suppresses_duplicates_within_window() {
        let engine = DeliveryEngine::in_memory();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let execute = flaky(0, calls.clone());
        let request = || {
            DeliveryRequest::new(
                "evt-6",
                "payments.captured",
                DeliveryGuarantee::AtMostOnce,
                execute.clone(),
            )
            .with_dedup_window(Duration::from_secs(10))
        };

        assert_eq!(
            engine.deliver(request()).await.unwrap(),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            engine.deliver(request()).await.unwrap(),
            DeliveryOutcome::Duplicate
        );
        assert_eq!(calls.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            engine.deliver(request()).await.unwrap(),
            DeliveryOutcome::Delivered
        );
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_at_most_once_never_retries_failures() {
        let engine = DeliveryEngine::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let request = || {
            DeliveryRequest::new(
                "evt-7",
                "payments.captured",
                DeliveryGuarantee::AtMostOnce,
                always_fail(calls.clone()),
            )
        };

        assert!(engine.deliver(request()).await.is_err());
        assert_eq!(
            engine.deliver(request()).await.unwrap(),
            DeliveryOutcome::Duplicate
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timers_and_is_idempotent() {
        let engine = DeliveryEngine::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let request = DeliveryRequest::new(
            "evt-8",
            "mail.send",
            DeliveryGuarantee::AtLeastOnce,
            always_fail(calls.clone()),
        )
        .with_retry_policy(fast_policy(5));

        engine.deliver(request.clone()).await.unwrap();
        assert_eq!(engine.pending_retries(), 1);

        engine.stop();
        engine.stop();
        assert!(engine.is_stopped());
        assert_eq!(engine.pending_retries(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Further failures are recorded but not rescheduled.
        assert_eq!(
            engine.deliver(request).await.unwrap(),
            DeliveryOutcome::Stopped { attempt: 2 }
        );
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_attempt_counts_survive_engine_restart() {
        let store: Arc<dyn DeliveryStore> = Arc::new(InMemoryDeliveryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let request = DeliveryRequest::new(
            "evt-9",
            "mail.send",
            DeliveryGuarantee::AtLeastOnce,
            always_fail(calls.clone()),
        )
        .with_retry_policy(fast_policy(2));

        let first = DeliveryEngine::builder(store.clone()).build();
        first.stop();
        assert_eq!(
            first.deliver(request.clone()).await.unwrap(),
            DeliveryOutcome::Stopped { attempt: 1 }
        );
        let state = store.get_retry_state("evt-9").await.unwrap().unwrap();
        assert_eq!(state.last_error.as_deref(), Some("still broken"));

        let second = DeliveryEngine::builder(store.clone()).build();
        assert_eq!(
            second.deliver(request).await.unwrap(),
            DeliveryOutcome::Exhausted { attempts: 2 }
        );
    }
}
