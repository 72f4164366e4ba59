//! Interceptor chains (onion model).
//!
//! An [`Interceptor`] wraps everything registered after it, including the
//! handler. [`compose`] folds a list of interceptors around a terminal call
//! from right to left, so the first interceptor in the list is the outermost:
//!
//! ```text
//! A-before ─► B-before ─► handler ─► B-after ─► A-after
//! ```
//!
//! An interceptor either calls [`Next::run`] (and may transform the result)
//! or short-circuits by returning its own [`Output`]; in that case nothing
//! inside it runs, handler included.
//!
//! # Example
//!
//! ```ignore
//! use courier::interceptor::{from_fn, Output};
//!
//! let timing = from_fn(|envelope, _ctx, next| async move {
//!     let started = std::time::Instant::now();
//!     let result = next.run().await;
//!     tracing::info!(procedure = %envelope.procedure, elapsed = ?started.elapsed(), "handled");
//!     result
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::stream::ValueStream;

/// What a chain produces: a single value, or a value sequence for streams.
pub enum Output {
    Value(Value),
    Stream(ValueStream),
}

impl Output {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Output::Value(v) => Some(v),
            Output::Stream(_) => None,
        }
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Value(value)
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Output::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Future returned by a [`Chain`].
pub type ChainFuture = BoxFuture<'static, anyhow::Result<Output>>;

/// A composed callable: envelope and context in, output out.
pub type Chain = Arc<dyn Fn(Envelope, Context) -> ChainFuture + Send + Sync>;

/// Cross-cutting logic around dispatch.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Run before and/or after `next`, or short-circuit by not calling it.
    async fn intercept(
        &self,
        envelope: &Envelope,
        ctx: &Context,
        next: Next,
    ) -> anyhow::Result<Output>;
}

/// The rest of the chain, bound to the current envelope and context.
pub struct Next {
    inner: Chain,
    envelope: Envelope,
    ctx: Context,
}

impl Next {
    /// Run everything inside this interceptor.
    pub async fn run(self) -> anyhow::Result<Output> {
        (self.inner)(self.envelope, self.ctx).await
    }

    /// Run the rest of the chain with a different context.
    pub async fn run_with(self, ctx: Context) -> anyhow::Result<Output> {
        (self.inner)(self.envelope, ctx).await
    }
}

/// Fold `interceptors` around `terminal`, first interceptor outermost.
pub fn compose(interceptors: &[Arc<dyn Interceptor>], terminal: Chain) -> Chain {
    interceptors.iter().rev().fold(terminal, |inner, interceptor| {
        let interceptor = Arc::clone(interceptor);
        Arc::new(move |envelope: Envelope, ctx: Context| -> ChainFuture {
            let interceptor = Arc::clone(&interceptor);
            let next = Next {
                inner: Arc::clone(&inner),
                envelope: envelope.clone(),
                ctx: ctx.clone(),
            };
            Box::pin(async move { interceptor.intercept(&envelope, &ctx, next).await })
        })
    })
}

/// Interceptor backed by a closure taking owned arguments.
pub struct FnInterceptor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Interceptor for FnInterceptor<F>
where
    F: Fn(Envelope, Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    async fn intercept(
        &self,
        envelope: &Envelope,
        ctx: &Context,
        next: Next,
    ) -> anyhow::Result<Output> {
        (self.f)(envelope.clone(), ctx.clone(), next).await
    }
}

/// Build an interceptor from a closure.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(Envelope, Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    Arc::new(FnInterceptor { f })
}
