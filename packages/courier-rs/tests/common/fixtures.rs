//! Handlers shared by the integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::{
    codes, Ack, Context, DeliveryGuarantee, HandlerRegistry, Registered, RetryPolicy, RpcError,
    ValueStream,
};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::Instant;

/// Initial delay for the at-least-once fixture.
pub const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Observations made by fixture handlers.
#[derive(Clone, Default)]
pub struct Probes {
    pub echo_calls: Arc<AtomicU32>,
    pub audit_calls: Arc<AtomicU32>,
    pub order_attempts: Arc<Mutex<Vec<Instant>>>,
    pub payment_calls: Arc<AtomicU32>,
    pub mail_calls: Arc<AtomicU32>,
    /// Calling levels seen by `nested.inspect`.
    pub inspected: Arc<Mutex<Vec<u32>>>,
}

impl Probes {
    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// A registry covering every handler shape.
pub fn registry(probes: &Probes) -> HandlerRegistry {
    HandlerRegistry::builder()
        // ---------------------------------------------------------------- procedures
        .register("echo", {
            let calls = probes.echo_calls.clone();
            Registered::procedure(move |input, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            })
        })
        .register(
            "math.double",
            Registered::procedure(|input: Value, _ctx| async move {
                let n = input["n"]
                    .as_i64()
                    .ok_or_else(|| RpcError::invalid_argument("n must be an integer"))?;
                Ok(json!(n * 2))
            }),
        )
        .register(
            "users.create",
            Registered::procedure(|_input, _ctx| async move {
                Err::<Value, _>(
                    RpcError::new(codes::VALIDATION_ERROR, "Invalid input")
                        .with_details(json!({ "field": "name" }))
                        .into(),
                )
            }),
        )
        .register(
            "reports.generate",
            Registered::procedure(|_input, _ctx| async move {
                Err::<Value, _>(anyhow::anyhow!("connection refused"))
            }),
        )
        .register(
            "nested.double",
            Registered::procedure(|input: Value, ctx: Context| async move {
                let doubled = ctx.call("math.double", input).await?;
                Ok(json!({ "doubled": doubled }))
            }),
        )
        .register(
            "nested.create",
            Registered::procedure(|input: Value, ctx: Context| async move {
                Ok(ctx.call("users.create", input).await?)
            }),
        )
        .register("nested.inspect", {
            let inspected = probes.inspected.clone();
            Registered::procedure(move |_input, ctx: Context| {
                let inspected = inspected.clone();
                async move {
                    inspected.lock().unwrap().push(ctx.calling_level);
                    Ok(json!(ctx.calling_level))
                }
            })
        })
        .register(
            "nested.hop",
            Registered::procedure(|input: Value, ctx: Context| async move {
                Ok(ctx.call("nested.inspect", input).await?)
            }),
        )
        .register(
            "nested.recurse",
            Registered::procedure(|input: Value, ctx: Context| async move {
                Ok(ctx.call("nested.recurse", input).await?)
            }),
        )
        // ---------------------------------------------------------------- streams
        .register(
            "count",
            Registered::server_stream(|input: Value, _ctx| {
                let count = input["count"].as_u64().unwrap_or(0);
                stream::iter((0..count).map(|i| Ok(json!(i))))
            }),
        )
        .register(
            "flaky.stream",
            Registered::server_stream(|_input, _ctx| {
                stream::iter(vec![
                    Ok(json!(1)),
                    Err(anyhow::anyhow!("sensor disconnected")),
                    Ok(json!(2)),
                ])
            }),
        )
        .register(
            "sum",
            Registered::client_stream(|input: ValueStream, _ctx| async move {
                let mut input = input;
                let mut total = 0i64;
                while let Some(item) = input.next().await {
                    total += item?.as_i64().unwrap_or(0);
                }
                Ok(json!(total))
            }),
        )
        .register(
            "upper",
            Registered::bidi_stream(|input: ValueStream, _ctx| {
                input.map(|item: anyhow::Result<Value>| -> anyhow::Result<Value> {
                    let item = item?;
                    Ok(json!(item.as_str().unwrap_or_default().to_uppercase()))
                })
            }),
        )
        // ---------------------------------------------------------------- events
        .register("audit", {
            let calls = probes.audit_calls.clone();
            Registered::event(move |_input, _ctx, _ack| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("audit sink unavailable")
                }
            })
        })
        .register("orders.placed", {
            let attempts = probes.order_attempts.clone();
            Registered::event(move |_input, _ctx, ack: Ack| {
                let attempts = attempts.clone();
                async move {
                    let attempt = {
                        let mut attempts = attempts.lock().unwrap();
                        attempts.push(Instant::now());
                        attempts.len()
                    };
                    if attempt == 1 {
                        anyhow::bail!("inventory service timed out");
                    }
                    ack.ack();
                    Ok(())
                }
            })
            .with_delivery(DeliveryGuarantee::AtLeastOnce)
            .with_retry_policy(RetryPolicy::new(3, RETRY_DELAY))
        })
        .register("payments.captured", {
            let calls = probes.payment_calls.clone();
            Registered::event(move |_input, _ctx, _ack| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_delivery(DeliveryGuarantee::AtMostOnce)
            .with_deduplication_window(Duration::from_secs(30))
        })
        .register("mail.send", {
            let calls = probes.mail_calls.clone();
            Registered::event(move |_input, _ctx, _ack| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("smtp relay rejected message")
                }
            })
            .with_delivery(DeliveryGuarantee::AtLeastOnce)
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100)))
        })
        .build()
}
