//! Stream framing.
//!
//! Handlers produce plain value sequences. The router turns them into
//! envelope sequences with [`into_envelope_stream`]:
//!
//! ```text
//! stream:start ─► stream:data(0) ─► stream:data(1) ─► ... ─► stream:end
//!                                          │
//!                                          └─ on failure ─► stream:error  (nothing after)
//! ```
//!
//! Framing lives here, not in handlers. A handler that fails mid-sequence
//! just yields an `Err`; the consumer sees exactly one terminal
//! `stream:error` frame.
//!
//! For producers that need back-pressure, [`channel`] hands out a bounded
//! sender and the matching [`ValueStream`].

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::envelope::{Envelope, RequestKind};
use crate::error::{codes, RpcError};

/// A sequence of values produced or consumed by a stream handler.
pub type ValueStream = BoxStream<'static, anyhow::Result<Value>>;

/// A sequence of framed envelopes returned by the router.
pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// Default capacity for [`channel`].
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

enum Framing {
    Start(ValueStream),
    Data(ValueStream, u64),
    Done,
}

/// Frame `source` as a stream-envelope sequence derived from `origin`.
///
/// Emits `stream:start` before polling the source, one `stream:data` per item,
/// then `stream:end`, or a single `stream:error` in its place. The returned
/// stream is finite and cannot be restarted.
pub fn into_envelope_stream(
    origin: &Envelope,
    source: ValueStream,
    expose_internal: bool,
) -> EnvelopeStream {
    let origin = origin.clone();

    stream::unfold(Framing::Start(source), move |state| {
        let origin = origin.clone();
        async move {
            match state {
                Framing::Start(source) => {
                    let start = origin.frame(RequestKind::StreamStart, "stream:start", Value::Null);
                    Some((start, Framing::Data(source, 0)))
                }
                Framing::Data(mut source, seq) => match source.next().await {
                    Some(Ok(item)) => {
                        let data = origin.frame(
                            RequestKind::StreamData,
                            &format!("stream:data:{}", seq),
                            item,
                        );
                        Some((data, Framing::Data(source, seq + 1)))
                    }
                    Some(Err(e)) => {
                        let err = RpcError::from_anyhow(&e, codes::STREAM_ERROR, expose_internal);
                        tracing::debug!(
                            id = %origin.id,
                            procedure = %origin.procedure,
                            code = %err.code,
                            "stream failed"
                        );
                        let frame =
                            origin.frame(RequestKind::StreamError, "stream:error", err.to_value());
                        Some((frame, Framing::Done))
                    }
                    None => {
                        let end = origin.frame(RequestKind::StreamEnd, "stream:end", Value::Null);
                        Some((end, Framing::Done))
                    }
                },
                Framing::Done => None,
            }
        }
    })
    .boxed()
}

/// A stream that yields `value` once.
pub fn once(value: Value) -> ValueStream {
    stream::once(async move { Ok(value) }).boxed()
}

/// A stream over already-known values.
pub fn iter<I>(values: I) -> ValueStream
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send + 'static,
{
    stream::iter(values.into_iter().map(Ok)).boxed()
}

/// Producer half of a bounded stream.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<anyhow::Result<Value>>,
}

impl StreamSender {
    /// Send one item, waiting for capacity.
    ///
    /// Returns `false` once the consumer is gone; producers should stop.
    pub async fn send(&self, value: Value) -> bool {
        self.tx.send(Ok(value)).await.is_ok()
    }

    /// Terminate the stream with an error. Consumes the sender.
    pub async fn fail(self, error: impl Into<anyhow::Error>) {
        let _ = self.tx.send(Err(error.into())).await;
    }

    /// True once the consumer dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded producer/consumer pair.
///
/// The stream ends when every sender is dropped. Sending waits while
/// `capacity` items are buffered.
pub fn channel(capacity: usize) -> (StreamSender, ValueStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, ReceiverStream::new(rx).boxed())
}
