//! The unit of dispatch.
//!
//! Every request, response, event and stream frame travels as an [`Envelope`].
//! Transport adapters build envelopes from their wire format and turn the
//! router's replies back into it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::stream::ValueStream;

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "stream:start")]
    StreamStart,
    #[serde(rename = "stream:data")]
    StreamData,
    #[serde(rename = "stream:end")]
    StreamEnd,
    #[serde(rename = "stream:error")]
    StreamError,
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "error")]
    Error,
}

impl RequestKind {
    /// The wire name (`request`, `stream:start`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Request => "request",
            RequestKind::StreamStart => "stream:start",
            RequestKind::StreamData => "stream:data",
            RequestKind::StreamEnd => "stream:end",
            RequestKind::StreamError => "stream:error",
            RequestKind::Event => "event",
            RequestKind::Response => "response",
            RequestKind::Error => "error",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Envelope payload: a JSON value, or an incoming async sequence.
///
/// Stream payloads only appear on `stream:start` envelopes for client and
/// bidi streams.
#[derive(Clone)]
pub enum Payload {
    Value(Value),
    Stream(InputStream),
}

impl Payload {
    /// The JSON value, if this is not a stream.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Stream(_) => None,
        }
    }

    /// Consume into the JSON value, if this is not a stream.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Stream(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Payload::Stream(_))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<ValueStream> for Payload {
    fn from(stream: ValueStream) -> Self {
        Payload::Stream(InputStream::new(stream))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Payload::Stream(s) => f.debug_tuple("Stream").field(s).finish(),
        }
    }
}

/// Take-once handle to an incoming sequence.
///
/// Clones share the same underlying stream; whichever clone takes it first
/// owns it. A second `take` returns `None`.
#[derive(Clone)]
pub struct InputStream {
    inner: Arc<Mutex<Option<ValueStream>>>,
}

impl InputStream {
    pub fn new(stream: ValueStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Take the stream out of the handle.
    pub fn take(&self) -> Option<ValueStream> {
        match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// True if the stream has not been taken yet.
    pub fn is_available(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("available", &self.is_available())
            .finish()
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// The unit of dispatch.
///
/// `id` is caller-supplied and must be unique per logical exchange. Frames
/// derived from a stream carry deterministic suffixes of the originating id.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub procedure: String,
    pub kind: RequestKind,
    pub payload: Payload,
    pub metadata: HashMap<String, String>,
    pub context: Context,
}

impl Envelope {
    /// Create an envelope with empty metadata and a fresh root context.
    pub fn new(
        id: impl Into<String>,
        procedure: impl Into<String>,
        kind: RequestKind,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind,
            payload: payload.into(),
            metadata: HashMap::new(),
            context: Context::new(),
        }
    }

    pub fn request(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self::new(id, procedure, RequestKind::Request, payload)
    }

    pub fn event(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self::new(id, procedure, RequestKind::Event, payload)
    }

    pub fn stream_start(
        id: impl Into<String>,
        procedure: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(id, procedure, RequestKind::StreamStart, payload)
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derive a reply that keeps this envelope's identity fields.
    pub fn reply(&self, kind: RequestKind, payload: Value) -> Envelope {
        Envelope {
            id: self.id.clone(),
            procedure: self.procedure.clone(),
            kind,
            payload: Payload::Value(payload),
            metadata: self.metadata.clone(),
            context: self.context.clone(),
        }
    }

    /// A `response` carrying `payload`.
    pub fn respond(&self, payload: Value) -> Envelope {
        self.reply(RequestKind::Response, payload)
    }

    /// An `error` carrying the wire shape of `err`.
    pub fn fail(&self, err: &RpcError) -> Envelope {
        self.reply(RequestKind::Error, err.to_value())
    }

    /// A stream frame with a suffixed id.
    pub(crate) fn frame(&self, kind: RequestKind, suffix: &str, payload: Value) -> Envelope {
        let mut frame = self.reply(kind, payload);
        frame.id = format!("{}:{}", self.id, suffix);
        frame
    }

    /// The payload as JSON, `Null` for stream payloads.
    pub fn value(&self) -> &Value {
        self.payload.as_value().unwrap_or(&Value::Null)
    }

    /// For `error` and `stream:error` envelopes, the typed error they carry.
    pub fn error(&self) -> Option<RpcError> {
        match self.kind {
            RequestKind::Error | RequestKind::StreamError => {
                Some(RpcError::from_payload(self.value()))
            }
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, RequestKind::Error | RequestKind::StreamError)
    }
}
