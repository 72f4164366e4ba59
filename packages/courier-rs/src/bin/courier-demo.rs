//! Dispatches a request, a server stream and an at-least-once event through
//! an in-process router and logs what comes back.
//!
//! Run with: RUST_LOG=courier=debug cargo run --bin courier-demo

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use courier::{
    DeliveryGuarantee, Envelope, HandlerRegistry, Registered, Reply, RetryPolicy, Router,
    RouterConfig,
};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = RouterConfig::from_env().context("Failed to load router configuration")?;
    tracing::info!(environment = ?config.environment, "Starting courier demo");

    let deliveries = Arc::new(AtomicU32::new(0));
    let router = Router::builder(registry(deliveries.clone()))
        .with_config(config)
        .build();

    let reply = router
        .handle(Envelope::request("demo-1", "greet", json!({ "name": "Ada" })))
        .await;
    log_reply(reply).await;

    let reply = router
        .handle(Envelope::stream_start("demo-2", "ticks", json!({ "count": 3 })))
        .await;
    log_reply(reply).await;

    let reply = router
        .handle(Envelope::event("demo-3", "orders.placed", json!({ "order": 42 })))
        .await;
    log_reply(reply).await;

    // Let the scheduled retry fire.
    tokio::time::sleep(Duration::from_millis(250)).await;
    tracing::info!(
        attempts = deliveries.load(Ordering::SeqCst),
        pending = router.delivery().pending_retries(),
        "Event settled"
    );

    router.stop();
    tracing::info!("Courier demo finished");
    Ok(())
}

fn registry(deliveries: Arc<AtomicU32>) -> HandlerRegistry {
    HandlerRegistry::builder()
        .register(
            "greet",
            Registered::procedure(|input: Value, _ctx| async move {
                let name = input["name"].as_str().unwrap_or("stranger");
                Ok(json!(format!("hello, {}", name)))
            })
            .with_description("Greets the caller by name"),
        )
        .register(
            "ticks",
            Registered::server_stream(|input: Value, _ctx| {
                let count = input["count"].as_u64().unwrap_or(1);
                stream::iter((0..count).map(|tick| Ok(json!({ "tick": tick }))))
            }),
        )
        .register(
            "orders.placed",
            Registered::event(move |_input, _ctx, _ack| {
                let deliveries = deliveries.clone();
                async move {
                    let attempt = deliveries.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt == 1 {
                        anyhow::bail!("warehouse not reachable yet");
                    }
                    Ok(())
                }
            })
            .with_delivery(DeliveryGuarantee::AtLeastOnce)
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100))),
        )
        .build()
}

async fn log_reply(reply: Reply) {
    match reply {
        Reply::Envelope(envelope) => tracing::info!(
            id = %envelope.id,
            kind = %envelope.kind,
            payload = %envelope.value(),
            "Reply"
        ),
        Reply::Stream(mut frames) => {
            while let Some(frame) = frames.next().await {
                tracing::info!(
                    id = %frame.id,
                    kind = %frame.kind,
                    payload = %frame.value(),
                    "Frame"
                );
            }
        }
    }
}
