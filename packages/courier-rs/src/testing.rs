//! Testing utilities for routers and handlers.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! courier = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use courier::testing::{collect, kinds, Recorder};
//!
//! let recorder = Recorder::new();
//! let router = Router::builder(registry)
//!     .with_interceptor(recorder.interceptor("outer"))
//!     .build();
//!
//! let frames = collect(router.handle(testing::stream_start("ticks", json!({ "count": 3 }))).await).await;
//! assert_eq!(kinds(&frames).len(), 5);
//! assert_eq!(recorder.entries(), vec!["outer-before", "outer-after"]);
//! ```

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{Envelope, RequestKind};
use crate::interceptor::{from_fn, Interceptor};
use crate::router::Reply;
use crate::stream::{self, ValueStream};

/// Drain a reply into envelopes. A single envelope becomes a one-item vec.
pub async fn collect(reply: Reply) -> Vec<Envelope> {
    match reply {
        Reply::Envelope(envelope) => vec![envelope],
        Reply::Stream(frames) => frames.collect().await,
    }
}

pub fn kinds(envelopes: &[Envelope]) -> Vec<RequestKind> {
    envelopes.iter().map(|e| e.kind).collect()
}

/// Payloads of `stream:data` frames, in order.
pub fn data(envelopes: &[Envelope]) -> Vec<Value> {
    envelopes
        .iter()
        .filter(|e| e.kind == RequestKind::StreamData)
        .map(|e| e.value().clone())
        .collect()
}

pub fn request(procedure: &str, payload: Value) -> Envelope {
    Envelope::request(Uuid::new_v4().to_string(), procedure, payload)
}

pub fn event(procedure: &str, payload: Value) -> Envelope {
    Envelope::event(Uuid::new_v4().to_string(), procedure, payload)
}

pub fn stream_start(procedure: &str, payload: Value) -> Envelope {
    Envelope::stream_start(Uuid::new_v4().to_string(), procedure, payload)
}

/// A `stream:start` whose payload is an incoming sequence.
pub fn stream_upload(procedure: &str, values: Vec<Value>) -> Envelope {
    let source: ValueStream = stream::iter(values);
    Envelope::stream_start(Uuid::new_v4().to_string(), procedure, source)
}

/// Shared log for observing interceptor order.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry.into()),
            Err(poisoned) => poisoned.into_inner().push(entry.into()),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// An interceptor that records `<name>-before` and `<name>-after`.
    pub fn interceptor(&self, name: &'static str) -> Arc<dyn Interceptor> {
        let recorder = self.clone();
        from_fn(move |_envelope, _ctx, next| {
            let recorder = recorder.clone();
            async move {
                recorder.record(format!("{}-before", name));
                let result = next.run().await;
                recorder.record(format!("{}-after", name));
                result
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerRegistry, Registered};
    use crate::router::Router;
    use serde_json::json;

    #[tokio::test]
    async fn test_collect_and_helpers() {
        let registry = HandlerRegistry::builder()
            .register(
                "sum",
                Registered::client_stream(|input: ValueStream, _ctx| async move {
                    let values: Vec<anyhow::Result<Value>> = input.collect().await;
                    let mut total = 0;
                    for value in values {
                        total += value?.as_i64().unwrap_or(0);
                    }
                    Ok(json!(total))
                }),
            )
            .build();
        let recorder = Recorder::new();
        let router = Router::builder(registry)
            .with_interceptor(recorder.interceptor("outer"))
            .build();

        let out = collect(
            router
                .handle(stream_upload("sum", vec![json!(1), json!(2), json!(3)]))
                .await,
        )
        .await;

        assert_eq!(kinds(&out), vec![RequestKind::Response]);
        assert_eq!(out[0].value(), &json!(6));
        assert_eq!(recorder.entries(), vec!["outer-before", "outer-after"]);
    }
}
