//! # Courier
//!
//! A protocol-agnostic dispatch core. Transport adapters (HTTP, WebSocket,
//! JSON-RPC, queues) turn their wire format into [`Envelope`]s; the
//! [`Router`] runs each one through an onion of [`Interceptor`]s to a
//! registered handler and hands back a reply envelope or a framed stream.
//!
//! ## Core Concepts
//!
//! - [`Envelope`] = the unit of dispatch (request, stream open, event, reply)
//! - [`Context`] = deadline, cancellation, auth, tracing, extensions and the
//!   nested-call binding that travel with an envelope
//! - [`Registry`] = name → handler lookup, one of three fixed shapes
//! - [`DeliveryEngine`] = decides if, when and how often event handlers run
//!
//! ## Architecture
//!
//! ```text
//! Transport adapter
//!     │
//!     ▼ handle(envelope)
//! Router ── entry checks (deadline, cancellation)
//!     │
//!     ├─► request ─────► [A ► B ► handler ► B ► A] ─► response | error
//!     │
//!     ├─► stream:start ─► [A ► B ► handler] ─► start, data*, end | error
//!     │
//!     └─► event ───────► DeliveryEngine ─► execute(ack) ─► [A ► B ► handler]
//!                          │                   ▲
//!                          └─ retry timers ────┘
//!
//! handler ─► ctx.call(procedure, input) ─► Router (calling level + 1)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Errors stop at the router** - `handle` always returns envelopes
//! 2. **Typed errors pass through verbatim** - everything else is `INTERNAL_ERROR`
//! 3. **Onion ordering** - global interceptors wrap handler interceptors, first added is outermost
//! 4. **Streams end exactly once** - `stream:end` or a single `stream:error`, never both
//! 5. **Bounded recursion** - nested calls fail at calling level 100
//! 6. **Interceptors are frozen at build** - no mutation during live dispatch
//!
//! ## Delivery Guarantees
//!
//! - **best-effort**: run once in the background, failures logged
//! - **at-least-once**: retry with exponential back-off until success or `ack()`
//! - **at-most-once**: repeated event ids are suppressed within a window
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Envelope, HandlerRegistry, Registered, Reply, Router};
//! use serde_json::json;
//!
//! let registry = HandlerRegistry::builder()
//!     .register("greet", Registered::procedure(|input, _ctx| async move {
//!         Ok(json!(format!("hello, {}", input["name"].as_str().unwrap_or("stranger"))))
//!     }))
//!     .build();
//!
//! let router = Router::builder(registry).build();
//! let reply = router.handle(Envelope::request("r-1", "greet", json!({ "name": "Ada" }))).await;
//! ```

pub mod config;
pub mod context;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod interceptor;
pub mod registry;
pub mod router;
pub mod stream;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Core types
pub use envelope::{Envelope, InputStream, Payload, RequestKind};

pub use context::{Context, Extensions, TraceContext, MAX_CALLING_DEPTH};

// Error types
pub use error::{codes, status_for_code, CourierError, HandlerKind, RpcError};

// Interceptors
pub use interceptor::{compose, from_fn, Chain, Interceptor, Next, Output};

// Registration
pub use registry::{
    HandlerMeta, HandlerRegistry, HandlerRegistryBuilder, Registered, Registry, StreamDirection,
    StreamHandler,
};

// Streams
pub use stream::{channel, EnvelopeStream, StreamSender, ValueStream};

// Router
pub use router::{Reply, Router, RouterBuilder};

// Delivery
pub use delivery::{
    Ack, DeadLetter, DeadLetterHandler, DeadLetterQueue, DeliveryEngine, DeliveryGuarantee,
    DeliveryOutcome, DeliveryRequest, DeliveryStore, InMemoryDeliveryStore, RetryPolicy,
    RetryState, StoreError,
};

// Configuration
pub use config::{Environment, RouterConfig};

// Re-export async_trait for implementing Interceptor, DeliveryStore and DeadLetterHandler
pub use async_trait::async_trait;
