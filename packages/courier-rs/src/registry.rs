//! Handler registration.
//!
//! The router resolves procedure names through the [`Registry`] trait. The
//! default [`HandlerRegistry`] is an immutable map from name to a tagged
//! [`Registered`] variant, built once and shared:
//!
//! ```ignore
//! let registry = HandlerRegistry::builder()
//!     .register("users.get", Registered::procedure(get_user))
//!     .register("ticks", Registered::server_stream(ticks))
//!     .register(
//!         "orders.placed",
//!         Registered::event(send_receipt)
//!             .with_delivery(DeliveryGuarantee::AtLeastOnce)
//!             .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(500))),
//!     )
//!     .build();
//! ```
//!
//! Handler shapes are fixed by the constructor used, so a stream handler can
//! never be reached as a procedure. Names share one namespace across kinds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::delivery::{Ack, DeliveryGuarantee, RetryPolicy};
use crate::error::{CourierError, HandlerKind, RpcError};
use crate::interceptor::Interceptor;
use crate::stream::ValueStream;

// =============================================================================
// Handler shapes
// =============================================================================

/// `request` handler: one value in, one value out.
pub type ProcedureFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Event handler. Returning `Ok` or calling [`Ack::ack`] both count as success.
pub type EventFn =
    Arc<dyn Fn(Value, Context, Ack) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Who produces data on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    /// Handler produces, caller consumes.
    #[default]
    Server,
    /// Caller produces, handler consumes and answers once.
    Client,
    /// Both sides produce.
    Bidi,
}

/// A stream handler in one of the three directions.
#[derive(Clone)]
pub enum StreamHandler {
    Server(Arc<dyn Fn(Value, Context) -> ValueStream + Send + Sync>),
    Client(
        Arc<dyn Fn(ValueStream, Context) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>,
    ),
    Bidi(Arc<dyn Fn(ValueStream, Context) -> ValueStream + Send + Sync>),
}

impl StreamHandler {
    pub fn direction(&self) -> StreamDirection {
        match self {
            StreamHandler::Server(_) => StreamDirection::Server,
            StreamHandler::Client(_) => StreamDirection::Client,
            StreamHandler::Bidi(_) => StreamDirection::Bidi,
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Registration-time options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerMeta {
    /// Set from the stream handler's shape at registration, for
    /// introspection. Dispatch goes by the [`StreamHandler`] variant.
    pub stream_direction: Option<StreamDirection>,
    pub delivery: Option<DeliveryGuarantee>,
    pub retry_policy: Option<RetryPolicy>,
    pub deduplication_window: Option<Duration>,
    pub description: Option<String>,
}

/// A handler with its own interceptors and options.
#[derive(Clone)]
pub struct Entry<H> {
    pub handler: H,
    /// Run inside the router's global interceptors.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    pub meta: HandlerMeta,
}

impl<H> Entry<H> {
    fn new(handler: H) -> Self {
        Self {
            handler,
            interceptors: Vec::new(),
            meta: HandlerMeta::default(),
        }
    }
}

pub type ProcedureEntry = Entry<ProcedureFn>;
pub type StreamEntry = Entry<StreamHandler>;
pub type EventEntry = Entry<EventFn>;

/// One registered name.
#[derive(Clone)]
pub enum Registered {
    Procedure(ProcedureEntry),
    Stream(StreamEntry),
    Event(EventEntry),
}

impl Registered {
    pub fn procedure<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let wrapped: ProcedureFn = Arc::new(move |input, ctx| handler(input, ctx).boxed());
        Registered::Procedure(Entry::new(wrapped))
    }

    /// Procedure over serde types.
    ///
    /// Input that does not deserialize into `I` fails with `INVALID_ARGUMENT`
    /// before the handler runs.
    pub fn typed_procedure<I, O, F, Fut>(handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::procedure(move |input: Value, ctx: Context| {
            let handler = Arc::clone(&handler);
            async move {
                let input: I = serde_json::from_value(input)
                    .map_err(|e| RpcError::invalid_argument(format!("invalid input: {}", e)))?;
                let output = handler(input, ctx).await?;
                Ok(serde_json::to_value(output)?)
            }
        })
    }

    pub fn server_stream<F, S>(handler: F) -> Self
    where
        F: Fn(Value, Context) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::stream(StreamHandler::Server(Arc::new(move |input, ctx| {
            handler(input, ctx).boxed()
        })))
    }

    pub fn client_stream<F, Fut>(handler: F) -> Self
    where
        F: Fn(ValueStream, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::stream(StreamHandler::Client(Arc::new(move |input, ctx| {
            handler(input, ctx).boxed()
        })))
    }

    pub fn bidi_stream<F, S>(handler: F) -> Self
    where
        F: Fn(ValueStream, Context) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::stream(StreamHandler::Bidi(Arc::new(move |input, ctx| {
            handler(input, ctx).boxed()
        })))
    }

    fn stream(handler: StreamHandler) -> Self {
        let mut entry = Entry::new(handler);
        entry.meta.stream_direction = Some(entry.handler.direction());
        Registered::Stream(entry)
    }

    /// Event handler, best-effort unless [`with_delivery`](Self::with_delivery)
    /// says otherwise.
    pub fn event<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, Context, Ack) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: EventFn = Arc::new(move |input, ctx, ack| handler(input, ctx, ack).boxed());
        Registered::Event(Entry::new(wrapped))
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Registered::Procedure(_) => HandlerKind::Procedure,
            Registered::Stream(_) => HandlerKind::Stream,
            Registered::Event(_) => HandlerKind::Event,
        }
    }

    pub fn meta(&self) -> &HandlerMeta {
        match self {
            Registered::Procedure(e) => &e.meta,
            Registered::Stream(e) => &e.meta,
            Registered::Event(e) => &e.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut HandlerMeta {
        match self {
            Registered::Procedure(e) => &mut e.meta,
            Registered::Stream(e) => &mut e.meta,
            Registered::Event(e) => &mut e.meta,
        }
    }

    /// Add a handler-specific interceptor. Runs after earlier ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        match &mut self {
            Registered::Procedure(e) => e.interceptors.push(interceptor),
            Registered::Stream(e) => e.interceptors.push(interceptor),
            Registered::Event(e) => e.interceptors.push(interceptor),
        }
        self
    }

    /// Only meaningful for events.
    pub fn with_delivery(mut self, delivery: DeliveryGuarantee) -> Self {
        self.meta_mut().delivery = Some(delivery);
        self
    }

    /// Only meaningful for at-least-once events.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.meta_mut().retry_policy = Some(policy);
        self
    }

    /// Only meaningful for at-most-once events.
    pub fn with_deduplication_window(mut self, window: Duration) -> Self {
        self.meta_mut().deduplication_window = Some(window);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta_mut().description = Some(description.into());
        self
    }
}

impl std::fmt::Debug for Registered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let interceptors = match self {
            Registered::Procedure(e) => e.interceptors.len(),
            Registered::Stream(e) => e.interceptors.len(),
            Registered::Event(e) => e.interceptors.len(),
        };
        f.debug_struct("Registered")
            .field("kind", &self.kind())
            .field("interceptors", &interceptors)
            .field("meta", self.meta())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Name lookup used by the router.
pub trait Registry: Send + Sync + 'static {
    fn procedure(&self, name: &str) -> Option<&ProcedureEntry>;
    fn stream(&self, name: &str) -> Option<&StreamEntry>;
    fn event(&self, name: &str) -> Option<&EventEntry>;
}

/// Immutable name → handler map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Registered>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Registered> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Registry for HandlerRegistry {
    fn procedure(&self, name: &str) -> Option<&ProcedureEntry> {
        match self.handlers.get(name) {
            Some(Registered::Procedure(entry)) => Some(entry),
            _ => None,
        }
    }

    fn stream(&self, name: &str) -> Option<&StreamEntry> {
        match self.handlers.get(name) {
            Some(Registered::Stream(entry)) => Some(entry),
            _ => None,
        }
    }

    fn event(&self, name: &str) -> Option<&EventEntry> {
        match self.handlers.get(name) {
            Some(Registered::Event(entry)) => Some(entry),
            _ => None,
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Registered>,
}

impl HandlerRegistryBuilder {
    /// Register a handler under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. Use `try_register` for a
    /// non-panicking version.
    pub fn register(self, name: impl Into<String>, registered: Registered) -> Self {
        self.try_register(name, registered)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Register a handler, returning an error if `name` is taken.
    pub fn try_register(
        mut self,
        name: impl Into<String>,
        registered: Registered,
    ) -> Result<Self, CourierError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(CourierError::AlreadyRegistered {
                kind: registered.kind(),
                name,
            });
        }
        self.handlers.insert(name, registered);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Registered {
        Registered::procedure(|input, _ctx| async move { Ok(input) })
    }

    #[test]
    fn test_lookup_respects_kind() {
        let registry = HandlerRegistry::builder()
            .register("echo", echo())
            .register(
                "ticks",
                Registered::server_stream(|_input, _ctx| crate::stream::iter(vec![json!(1)])),
            )
            .register(
                "audit",
                Registered::event(|_input, _ctx, _ack| async move { Ok(()) }),
            )
            .build();

        assert!(registry.procedure("echo").is_some());
        assert!(registry.stream("echo").is_none());
        assert!(registry.stream("ticks").is_some());
        assert!(registry.procedure("ticks").is_none());
        assert!(registry.event("audit").is_some());
        assert!(registry.event("missing").is_none());
        assert_eq!(registry.names(), vec!["audit", "echo", "ticks"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let result = HandlerRegistry::builder()
            .register("echo", echo())
            .try_register(
                "echo",
                Registered::event(|_input, _ctx, _ack| async move { Ok(()) }),
            );

        let err = result.err().unwrap();
        assert_eq!(err.to_string(), "handler already registered for event echo");
    }

    #[test]
    #[should_panic(expected = "handler already registered for procedure echo")]
    fn test_register_panics_on_duplicate() {
        let _ = HandlerRegistry::builder()
            .register("echo", echo())
            .register("echo", echo());
    }

    #[test]
    fn test_stream_direction_follows_shape() {
        let client = Registered::client_stream(|input: ValueStream, _ctx| async move {
            Ok(json!(input.count().await))
        });
        let bidi = Registered::bidi_stream(|input: ValueStream, _ctx| input);
        let server = Registered::server_stream(|_input, _ctx| {
            futures::stream::empty::<anyhow::Result<Value>>()
        });

        assert_eq!(client.meta().stream_direction, Some(StreamDirection::Client));
        assert_eq!(bidi.meta().stream_direction, Some(StreamDirection::Bidi));
        assert_eq!(server.meta().stream_direction, Some(StreamDirection::Server));

        for registered in [client, bidi, server] {
            let Registered::Stream(entry) = &registered else {
                panic!("expected a stream registration");
            };
            assert_eq!(entry.meta.stream_direction, Some(entry.handler.direction()));
        }

        let procedure = Registered::procedure(|input, _ctx| async move { Ok(input) });
        assert_eq!(procedure.meta().stream_direction, None);
    }

    #[test]
    fn test_meta_builders() {
        let registered = Registered::event(|_input, _ctx, _ack| async move { Ok(()) })
            .with_delivery(DeliveryGuarantee::AtMostOnce)
            .with_deduplication_window(Duration::from_secs(30))
            .with_description("payment captured");

        let meta = registered.meta();
        assert_eq!(meta.delivery, Some(DeliveryGuarantee::AtMostOnce));
        assert_eq!(meta.deduplication_window, Some(Duration::from_secs(30)));
        assert_eq!(meta.description.as_deref(), Some("payment captured"));
    }

    #[tokio::test]
    async fn test_typed_procedure_validates_input() {
        #[derive(Deserialize)]
        struct Add {
            a: i64,
            b: i64,
        }

        let registered =
            Registered::typed_procedure(|input: Add, _ctx| async move { Ok(input.a + input.b) });
        let Registered::Procedure(entry) = registered else {
            panic!("expected procedure");
        };

        let sum = (entry.handler)(json!({ "a": 2, "b": 3 }), Context::new())
            .await
            .unwrap();
        assert_eq!(sum, json!(5));

        let err = (entry.handler)(json!({ "a": "two" }), Context::new())
            .await
            .unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.code, crate::error::codes::INVALID_ARGUMENT);
    }
}
