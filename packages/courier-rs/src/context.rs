//! Per-dispatch context.
//!
//! A [`Context`] travels with every envelope. It carries the deadline and
//! cancellation signal checked at dispatch entry, caller identity and tracing
//! data, an extension map, and the nested-call binding that lets a handler
//! dispatch another procedure through the same router.
//!
//! # Immutability
//!
//! Contexts are cheap to clone and never mutated in place. Every `with_*`
//! method returns a new context; the extension map is copied on extend, so a
//! handler extending its context never affects the caller's.
//!
//! # Nested calls
//!
//! ```ignore
//! async fn checkout(input: Value, ctx: Context) -> anyhow::Result<Value> {
//!     let cart = ctx.call("cart.get", input.clone()).await?;
//!     let total = ctx.call("pricing.total", cart).await?;
//!     Ok(json!({ "total": total }))
//! }
//! ```
//!
//! Each nested call runs one calling level deeper. Once the level reaches
//! [`MAX_CALLING_DEPTH`], `call` fails with `CALLING_DEPTH_EXCEEDED` before any
//! envelope is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::{Envelope, RequestKind};
use crate::error::{codes, RpcError};

/// Nested-call recursion bound.
pub const MAX_CALLING_DEPTH: u32 = 100;

/// Metadata key marking envelopes synthesized by [`Context::call`].
pub const INTERNAL_CALL_KEY: &str = "x-courier-internal-call";

/// Metadata key naming the procedure that issued a nested call.
pub const CALLER_KEY: &str = "x-courier-caller";

/// Distributed tracing identifiers, opaque to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace with random ids.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            parent_span_id: None,
        }
    }

    /// A child span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Copy-on-extend extension map.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    values: Arc<HashMap<String, Value>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserialize an extension into a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// A new map with `key` set; `self` is unchanged.
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value);
        Self {
            values: Arc::new(values),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Function the router installs so handlers can re-enter it.
pub(crate) type DispatchFn = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Envelope> + Send + Sync>;

/// Router binding for nested calls.
#[derive(Clone)]
pub(crate) struct CallBinding {
    pub(crate) dispatch: DispatchFn,
    /// Procedure whose handler holds this context.
    pub(crate) caller: String,
}

/// Per-dispatch context.
#[derive(Clone)]
pub struct Context {
    pub deadline: Option<DateTime<Utc>>,
    pub signal: CancellationToken,
    pub auth: Option<Value>,
    pub tracing: Option<TraceContext>,
    pub extensions: Extensions,
    pub calling_level: u32,
    binding: Option<CallBinding>,
}

impl Context {
    /// A root context: no deadline, fresh signal, calling level 0.
    pub fn new() -> Self {
        Self {
            deadline: None,
            signal: CancellationToken::new(),
            auth: None,
            tracing: None,
            extensions: Extensions::new(),
            calling_level: 0,
            binding: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_deadline(deadline)
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_auth(mut self, auth: Value) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_tracing(mut self, tracing: TraceContext) -> Self {
        self.tracing = Some(tracing);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions = self.extensions.with(key, value);
        self
    }

    /// True once `now` is past the deadline.
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Utc::now() > d).unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Context for a nested dispatch: same base fields, one level deeper,
    /// child span if tracing is present.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            signal: self.signal.clone(),
            auth: self.auth.clone(),
            tracing: self.tracing.as_ref().map(TraceContext::child),
            extensions: self.extensions.clone(),
            calling_level: self.calling_level + 1,
            binding: self.binding.clone(),
        }
    }

    pub(crate) fn bind(mut self, binding: CallBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// True if this context can issue nested calls.
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Dispatch `procedure` through the router that is running this handler.
    ///
    /// Returns the response payload, or the typed error carried by the error
    /// envelope. Failures are never swallowed.
    pub async fn call(&self, procedure: &str, input: Value) -> Result<Value, RpcError> {
        if self.calling_level >= MAX_CALLING_DEPTH {
            return Err(RpcError::new(
                codes::CALLING_DEPTH_EXCEEDED,
                format!(
                    "calling depth {} reached while calling {}",
                    self.calling_level, procedure
                ),
            ));
        }

        let binding = self.binding.as_ref().ok_or_else(|| {
            RpcError::internal("context is not bound to a router; nested calls are unavailable")
        })?;

        let envelope = Envelope::request(Uuid::new_v4().to_string(), procedure, input)
            .with_metadata(INTERNAL_CALL_KEY, "true")
            .with_metadata(CALLER_KEY, binding.caller.clone())
            .with_context(self.child());

        let reply = (binding.dispatch)(envelope).await;
        match reply.kind {
            RequestKind::Response => Ok(reply.payload.into_value().unwrap_or(Value::Null)),
            RequestKind::Error => Err(RpcError::from_payload(reply.value())),
            other => Err(RpcError::internal(format!(
                "nested call to {} produced a {} envelope",
                procedure, other
            ))),
        }
    }

    /// Typed convenience over [`Context::call`].
    pub async fn call_as<I, O>(&self, procedure: &str, input: &I) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)
            .map_err(|e| RpcError::invalid_argument(format!("unserializable input: {}", e)))?;
        let output = self.call(procedure, input).await?;
        serde_json::from_value(output)
            .map_err(|e| RpcError::internal(format!("unexpected output from {}: {}", procedure, e)))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.signal.is_cancelled())
            .field("auth", &self.auth)
            .field("tracing", &self.tracing)
            .field("extensions", &self.extensions.len())
            .field("calling_level", &self.calling_level)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}
