//! The dispatch state machine.
//!
//! A [`Router`] takes one [`Envelope`] and returns either a reply envelope or
//! a framed envelope stream:
//!
//! ```text
//!   envelope
//!      │
//!      ├─ deadline passed?     ─► error DEADLINE_EXCEEDED
//!      ├─ signal cancelled?    ─► error CANCELLED
//!      │
//!      ├─ request       ─► [global ++ handler interceptors] ─► procedure ─► response
//!      ├─ stream:start  ─► [interceptors] ─► stream handler ─► start/data/end frames
//!      ├─ event         ─► delivery engine ─► [interceptors] ─► event handler
//!      │                   (reply is {"received": true})
//!      └─ anything else ─► error INVALID_TYPE
//! ```
//!
//! Errors never escape [`Router::handle`]. A typed [`RpcError`] returned by a
//! handler or interceptor reaches the caller verbatim; anything else becomes
//! `INTERNAL_ERROR`. Panics are caught and reported the same way.
//!
//! # Example
//!
//! ```ignore
//! let router = Router::builder(registry)
//!     .with_interceptor(auth)
//!     .with_interceptor(timing)
//!     .with_config(RouterConfig::from_env()?)
//!     .build();
//!
//! match router.handle(Envelope::request("r-1", "users.get", json!({ "id": 7 }))).await {
//!     Reply::Envelope(reply) => send(reply),
//!     Reply::Stream(frames) => forward(frames),
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::config::RouterConfig;
use crate::context::{CallBinding, Context, DispatchFn};
use crate::delivery::{
    Ack, DeadLetterHandler, DeliveryEngine, DeliveryGuarantee, DeliveryRequest, DeliveryStore,
    ExecuteFn, InMemoryDeliveryStore,
};
use crate::envelope::{Envelope, Payload, RequestKind};
use crate::error::{codes, panic_message, RpcError};
use crate::interceptor::{compose, Chain, ChainFuture, Interceptor, Output};
use crate::registry::{Registry, StreamHandler};
use crate::stream::{self as framing, EnvelopeStream, ValueStream};

/// What [`Router::handle`] produces.
pub enum Reply {
    /// A `response` or `error` envelope.
    Envelope(Envelope),
    /// Stream frames, ending with `stream:end` or `stream:error`.
    Stream(EnvelopeStream),
}

impl Reply {
    pub fn is_stream(&self) -> bool {
        matches!(self, Reply::Stream(_))
    }

    /// The single envelope, if this is not a stream.
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Reply::Envelope(envelope) => Some(envelope),
            Reply::Stream(_) => None,
        }
    }

    /// The frame stream, if this is one.
    pub fn into_stream(self) -> Option<EnvelopeStream> {
        match self {
            Reply::Envelope(_) => None,
            Reply::Stream(frames) => Some(frames),
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Envelope(envelope) => f.debug_tuple("Envelope").field(envelope).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects global interceptors and delivery wiring, then freezes them.
pub struct RouterBuilder {
    registry: Arc<dyn Registry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    store: Option<Arc<dyn DeliveryStore>>,
    dead_letters: Option<Arc<dyn DeadLetterHandler>>,
    config: RouterConfig,
}

impl RouterBuilder {
    pub fn new(registry: impl Registry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            interceptors: Vec::new(),
            store: None,
            dead_letters: None,
            config: RouterConfig::default(),
        }
    }

    /// Append a global interceptor. The first one added is outermost.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Retry-state and dedup storage. Defaults to in-memory.
    pub fn with_delivery_store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Receives at-least-once events that ran out of attempts.
    pub fn with_dead_letters(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letters = Some(handler);
        self
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Router {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryDeliveryStore::new()));
        let mut engine = DeliveryEngine::builder(store)
            .default_policy(self.config.default_retry_policy.clone())
            .default_dedup_window(self.config.default_deduplication_window);
        if let Some(handler) = self.dead_letters {
            engine = engine.dead_letters(handler);
        }

        Router {
            inner: Arc::new(RouterInner {
                registry: self.registry,
                interceptors: self.interceptors,
                engine: engine.build(),
                expose_internal: self.config.expose_internal_errors(),
            }),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes envelopes to registered handlers.
///
/// Cheap to clone; clones share the registry, interceptors and delivery
/// engine. Independent routers share nothing.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: Arc<dyn Registry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    engine: DeliveryEngine,
    expose_internal: bool,
}

impl Router {
    pub fn builder(registry: impl Registry) -> RouterBuilder {
        RouterBuilder::new(registry)
    }

    /// Dispatch one envelope.
    pub async fn handle(&self, envelope: Envelope) -> Reply {
        dispatch(Arc::clone(&self.inner), envelope).await
    }

    /// Cancel pending event retries. Idempotent.
    pub fn stop(&self) {
        self.inner.engine.stop();
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.inner.engine
    }

    pub fn interceptor_count(&self) -> usize {
        self.inner.interceptors.len()
    }
}

/// Boxed entry point; nested calls re-enter the router through here, one
/// spawned task per level.
fn dispatch(inner: Arc<RouterInner>, envelope: Envelope) -> BoxFuture<'static, Reply> {
    Box::pin(async move { inner.route(envelope).await })
}

impl RouterInner {
    async fn route(self: &Arc<Self>, envelope: Envelope) -> Reply {
        let ctx = &envelope.context;

        if ctx.is_expired() {
            debug!(id = %envelope.id, procedure = %envelope.procedure, "deadline exceeded before dispatch");
            let err = RpcError::new(codes::DEADLINE_EXCEEDED, "deadline exceeded before dispatch");
            return Reply::Envelope(envelope.fail(&err));
        }
        if ctx.is_cancelled() {
            debug!(id = %envelope.id, procedure = %envelope.procedure, "cancelled before dispatch");
            let err = RpcError::new(codes::CANCELLED, "request cancelled before dispatch");
            return Reply::Envelope(envelope.fail(&err));
        }

        match envelope.kind {
            RequestKind::Request => Reply::Envelope(self.handle_request(envelope).await),
            RequestKind::StreamStart => self.handle_stream(envelope).await,
            RequestKind::Event => Reply::Envelope(self.handle_event(envelope).await),
            other => {
                debug!(id = %envelope.id, kind = %other, "unroutable envelope kind");
                let err = RpcError::new(
                    codes::INVALID_TYPE,
                    format!("cannot dispatch a {} envelope", other),
                );
                Reply::Envelope(envelope.fail(&err))
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, envelope: Envelope) -> Envelope {
        let Some(entry) = self.registry.procedure(&envelope.procedure) else {
            return self.not_found(&envelope, "procedure");
        };
        if envelope.payload.is_stream() {
            return self.reject(&envelope, "request payload must be a value, not a stream");
        }

        let handler = entry.handler.clone();
        let terminal: Chain = Arc::new(move |env: Envelope, ctx: Context| -> ChainFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let input = env.payload.into_value().unwrap_or(Value::Null);
                Ok(Output::Value(handler(input, ctx).await?))
            })
        });
        let chain = compose(&self.chain_for(&entry.interceptors), terminal);
        let ctx = self.handler_context(&envelope);

        match run_chain(&chain, envelope.clone(), ctx).await {
            Ok(Output::Value(value)) => envelope.respond(value),
            Ok(Output::Stream(_)) => self.fail(
                &envelope,
                RpcError::internal("interceptor produced a stream for a request").into(),
            ),
            Err(e) => self.fail(&envelope, e),
        }
    }

    async fn handle_stream(self: &Arc<Self>, envelope: Envelope) -> Reply {
        let Some(entry) = self.registry.stream(&envelope.procedure) else {
            return Reply::Envelope(self.not_found(&envelope, "stream"));
        };

        let terminal: Chain = match entry.handler.clone() {
            StreamHandler::Server(handler) => {
                if envelope.payload.is_stream() {
                    return Reply::Envelope(
                        self.reject(&envelope, "server stream payload must be a value"),
                    );
                }
                Arc::new(move |env: Envelope, ctx: Context| -> ChainFuture {
                    let handler = handler.clone();
                    Box::pin(async move {
                        let input = env.payload.into_value().unwrap_or(Value::Null);
                        Ok(Output::Stream(handler(input, ctx)))
                    })
                })
            }
            StreamHandler::Client(handler) => {
                if !envelope.payload.is_stream() {
                    return Reply::Envelope(
                        self.reject(&envelope, "client stream payload must be a stream"),
                    );
                }
                Arc::new(move |env: Envelope, ctx: Context| -> ChainFuture {
                    let handler = handler.clone();
                    Box::pin(async move {
                        let input = take_input(&env)?;
                        Ok(Output::Value(handler(input, ctx).await?))
                    })
                })
            }
            StreamHandler::Bidi(handler) => {
                if !envelope.payload.is_stream() {
                    return Reply::Envelope(
                        self.reject(&envelope, "bidi stream payload must be a stream"),
                    );
                }
                Arc::new(move |env: Envelope, ctx: Context| -> ChainFuture {
                    let handler = handler.clone();
                    Box::pin(async move {
                        let input = take_input(&env)?;
                        Ok(Output::Stream(handler(input, ctx)))
                    })
                })
            }
        };

        let produces_stream = !matches!(entry.handler, StreamHandler::Client(_));
        let chain = compose(&self.chain_for(&entry.interceptors), terminal);
        let ctx = self.handler_context(&envelope);

        match run_chain(&chain, envelope.clone(), ctx).await {
            Ok(Output::Stream(source)) if produces_stream => Reply::Stream(
                framing::into_envelope_stream(&envelope, guard_panics(source), self.expose_internal),
            ),
            // A plain value from a short-circuiting interceptor is a one-item stream.
            Ok(Output::Value(value)) if produces_stream => Reply::Stream(
                framing::into_envelope_stream(&envelope, framing::once(value), self.expose_internal),
            ),
            Ok(Output::Value(value)) => Reply::Envelope(envelope.respond(value)),
            Ok(Output::Stream(_)) => Reply::Envelope(self.fail(
                &envelope,
                RpcError::internal("interceptor produced a stream for a client stream").into(),
            )),
            Err(e) => Reply::Envelope(self.fail(&envelope, e)),
        }
    }

    async fn handle_event(self: &Arc<Self>, envelope: Envelope) -> Envelope {
        let Some(entry) = self.registry.event(&envelope.procedure) else {
            return self.not_found(&envelope, "event");
        };
        if envelope.payload.is_stream() {
            return self.reject(&envelope, "event payload must be a value, not a stream");
        }

        let guarantee = entry.meta.delivery.unwrap_or_default();
        let handler = entry.handler.clone();
        let interceptors = self.chain_for(&entry.interceptors);
        let ctx = self.handler_context(&envelope);
        let origin = envelope.clone();

        // The chain is rebuilt per attempt so each run gets its own ack.
        let execute: ExecuteFn = Arc::new(move |ack: Ack| -> BoxFuture<'static, anyhow::Result<()>> {
            let handler = handler.clone();
            let terminal: Chain = Arc::new(move |env: Envelope, ctx: Context| -> ChainFuture {
                let handler = handler.clone();
                let ack = ack.clone();
                Box::pin(async move {
                    let input = env.payload.into_value().unwrap_or(Value::Null);
                    handler(input, ctx, ack).await?;
                    Ok(Output::Value(Value::Null))
                })
            });
            let chain = compose(&interceptors, terminal);
            let envelope = origin.clone();
            let ctx = ctx.clone();
            Box::pin(async move { run_chain(&chain, envelope, ctx).await.map(|_| ()) })
        });

        let mut request =
            DeliveryRequest::new(envelope.id.clone(), envelope.procedure.clone(), guarantee, execute);
        request.retry_policy = entry.meta.retry_policy.clone();
        request.dedup_window = entry.meta.deduplication_window;

        match guarantee {
            DeliveryGuarantee::BestEffort => {
                let engine = self.engine.clone();
                let (event_id, procedure) = (envelope.id.clone(), envelope.procedure.clone());
                tokio::spawn(async move {
                    if let Err(e) = engine.deliver(request).await {
                        warn!(
                            event_id = %event_id,
                            procedure = %procedure,
                            error = %e,
                            "best-effort event handler failed"
                        );
                    }
                });
            }
            DeliveryGuarantee::AtLeastOnce | DeliveryGuarantee::AtMostOnce => {
                match self.engine.deliver(request).await {
                    Ok(outcome) => debug!(
                        event_id = %envelope.id,
                        procedure = %envelope.procedure,
                        guarantee = %guarantee,
                        ?outcome,
                        "event delivered"
                    ),
                    Err(e) => return self.fail(&envelope, e),
                }
            }
        }

        envelope.respond(json!({ "received": true }))
    }

    /// Global interceptors first, then the handler's own.
    fn chain_for(&self, local: &[Arc<dyn Interceptor>]) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors.iter().chain(local).cloned().collect()
    }

    /// The envelope's context, bound so the handler can issue nested calls.
    fn handler_context(self: &Arc<Self>, envelope: &Envelope) -> Context {
        let router: Weak<RouterInner> = Arc::downgrade(self);
        let dispatch_fn: DispatchFn = Arc::new(move |nested: Envelope| -> BoxFuture<'static, Envelope> {
            let router = router.clone();
            Box::pin(async move {
                let Some(inner) = router.upgrade() else {
                    return nested.fail(&RpcError::new(codes::UNAVAILABLE, "router is gone"));
                };
                let origin = nested.clone();
                // Each hop polls on its own task so stack use stays flat per level.
                match tokio::spawn(dispatch(inner, nested)).await {
                    Ok(Reply::Envelope(reply)) => reply,
                    Ok(Reply::Stream(_)) => {
                        origin.fail(&RpcError::internal("nested call produced a stream"))
                    }
                    Err(e) => {
                        error!(
                            id = %origin.id,
                            procedure = %origin.procedure,
                            error = %e,
                            "nested call task failed"
                        );
                        origin.fail(&RpcError::internal(format!("nested call task failed: {}", e)))
                    }
                }
            })
        });

        envelope.context.clone().bind(CallBinding {
            dispatch: dispatch_fn,
            caller: envelope.procedure.clone(),
        })
    }

    fn not_found(&self, envelope: &Envelope, what: &str) -> Envelope {
        debug!(id = %envelope.id, procedure = %envelope.procedure, "no {} registered", what);
        envelope.fail(&RpcError::not_found(format!(
            "no {} registered for {}",
            what, envelope.procedure
        )))
    }

    fn reject(&self, envelope: &Envelope, message: &str) -> Envelope {
        debug!(id = %envelope.id, procedure = %envelope.procedure, "{}", message);
        envelope.fail(&RpcError::invalid_argument(message))
    }

    /// Turn a chain error into an error envelope.
    fn fail(&self, envelope: &Envelope, error: anyhow::Error) -> Envelope {
        let err = RpcError::from_anyhow(&error, codes::INTERNAL_ERROR, self.expose_internal);
        let typed = error
            .chain()
            .any(|cause| cause.downcast_ref::<RpcError>().is_some());

        if typed {
            debug!(
                id = %envelope.id,
                procedure = %envelope.procedure,
                code = %err.code,
                "handler returned typed error"
            );
        } else {
            error!(
                id = %envelope.id,
                procedure = %envelope.procedure,
                error = ?error,
                "handler failed"
            );
        }
        envelope.fail(&err)
    }
}

/// Run a chain, turning a panic into an error.
async fn run_chain(chain: &Chain, envelope: Envelope, ctx: Context) -> anyhow::Result<Output> {
    let id = envelope.id.clone();
    match AssertUnwindSafe(chain(envelope, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => {
            let panic_msg = panic_message(&*panic_info);
            error!(%id, panic = %panic_msg, "handler panicked");
            Err(anyhow::anyhow!("handler panicked: {}", panic_msg))
        }
    }
}

/// Take the incoming sequence of a client or bidi stream.
fn take_input(envelope: &Envelope) -> anyhow::Result<ValueStream> {
    match &envelope.payload {
        Payload::Stream(input) => input
            .take()
            .ok_or_else(|| RpcError::invalid_argument("stream payload was already consumed").into()),
        Payload::Value(_) => Err(RpcError::invalid_argument("payload must be a stream").into()),
    }
}

/// Turn a panic while producing an item into a terminal error item.
fn guard_panics(source: ValueStream) -> ValueStream {
    stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        let polled = AssertUnwindSafe(source.next()).catch_unwind().await;
        match polled {
            Ok(Some(item)) => Some((item, Some(source))),
            Ok(None) => None,
            Err(panic_info) => {
                let panic_msg = panic_message(&*panic_info);
                error!(panic = %panic_msg, "stream handler panicked");
                Some((
                    Err(anyhow::anyhow!("stream handler panicked: {}", panic_msg)),
                    None,
                ))
            }
        }
    })
    .boxed()
}
