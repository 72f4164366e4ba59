//! Router harness for integration testing.
//!
//! Each test gets a fresh router over the fixture registry, an in-memory
//! delivery store it can inspect, and a dead-letter queue.

use std::sync::Arc;

use courier::{
    DeadLetterQueue, Envelope, InMemoryDeliveryStore, Interceptor, Reply, Router, RouterConfig,
};
use futures::StreamExt;
use test_context::AsyncTestContext;

use super::{registry, Probes};

pub struct TestHarness {
    pub router: Router,
    pub probes: Probes,
    pub store: Arc<InMemoryDeliveryStore>,
    pub dead_letters: Arc<DeadLetterQueue>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new(Vec::new())
    }

    async fn teardown(self) {
        self.router.stop();
    }
}

impl TestHarness {
    /// Build a harness whose router runs `interceptors` globally, in order.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        init_tracing();

        let probes = Probes::default();
        let store = Arc::new(InMemoryDeliveryStore::new());
        let dead_letters = Arc::new(DeadLetterQueue::new());

        let mut builder = Router::builder(registry(&probes))
            .with_delivery_store(store.clone())
            .with_dead_letters(dead_letters.clone())
            .with_config(RouterConfig::default());
        for interceptor in interceptors {
            builder = builder.with_interceptor(interceptor);
        }

        Self {
            router: builder.build(),
            probes,
            store,
            dead_letters,
        }
    }

    /// Dispatch and expect a single envelope back.
    pub async fn send(&self, envelope: Envelope) -> Envelope {
        match self.router.handle(envelope).await {
            Reply::Envelope(reply) => reply,
            Reply::Stream(_) => panic!("expected a single envelope, got a stream"),
        }
    }

    /// Dispatch and drain every frame.
    pub async fn frames(&self, envelope: Envelope) -> Vec<Envelope> {
        match self.router.handle(envelope).await {
            Reply::Envelope(reply) => vec![reply],
            Reply::Stream(frames) => frames.collect().await,
        }
    }
}

/// Initialize tracing subscriber to respect RUST_LOG environment variable.
/// Uses try_init() to avoid panicking if already initialized.
/// Run tests with: RUST_LOG=courier=debug cargo test -- --nocapture
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
