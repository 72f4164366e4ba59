//! Structured error types for courier.
//!
//! `RpcError` is the canonical cross-protocol error shape. Every failure that
//! leaves [`Router::handle`](crate::Router::handle) is an `RpcError` carried in
//! an `error` envelope (or a `stream:error` frame).
//! `CourierError` covers setup-time mistakes (registration, configuration).
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the router boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers and interceptors)
//! - `RpcError` is the only externalized error (structured for adapters)
//!
//! A handler raises a typed error by returning an `RpcError`:
//!
//! ```ignore
//! use courier::{codes, RpcError};
//!
//! async fn create_user(input: Value, _ctx: Context) -> anyhow::Result<Value> {
//!     if input.get("name").is_none() {
//!         return Err(RpcError::new(codes::VALIDATION_ERROR, "Invalid input")
//!             .with_details(json!({ "field": "name" }))
//!             .into());
//!     }
//!     Ok(json!({ "created": true }))
//! }
//! ```
//!
//! Any other error is downgraded to `INTERNAL_ERROR` by the router.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Well-known error codes.
///
/// Applications may use any other string as a code; unknown codes map to
/// status 500 unless the thrower sets one explicitly.
pub mod codes {
    /// The context deadline had already passed at dispatch time.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// The context signal was already cancelled at dispatch time.
    pub const CANCELLED: &str = "CANCELLED";
    /// No procedure, stream or event is registered under the name.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The payload does not fit the handler's shape.
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    /// The envelope type cannot be dispatched.
    pub const INVALID_TYPE: &str = "INVALID_TYPE";
    /// Nested `ctx.call` recursion hit the depth bound.
    pub const CALLING_DEPTH_EXCEEDED: &str = "CALLING_DEPTH_EXCEEDED";
    /// A stream failed with an untyped error.
    pub const STREAM_ERROR: &str = "STREAM_ERROR";
    /// Catch-all for untyped failures.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONFLICT: &str = "CONFLICT";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

/// HTTP-compatible status for an error code.
///
/// This table is fixed. Codes it does not know map to 500.
pub fn status_for_code(code: &str) -> u16 {
    match code {
        codes::BAD_REQUEST
        | codes::VALIDATION_ERROR
        | codes::INVALID_ARGUMENT
        | codes::INVALID_TYPE => 400,
        codes::UNAUTHORIZED => 401,
        codes::FORBIDDEN => 403,
        codes::NOT_FOUND => 404,
        codes::TIMEOUT => 408,
        codes::CONFLICT => 409,
        codes::PAYLOAD_TOO_LARGE => 413,
        codes::RATE_LIMITED => 429,
        codes::CANCELLED => 499,
        codes::NOT_IMPLEMENTED => 501,
        codes::UNAVAILABLE => 503,
        codes::DEADLINE_EXCEEDED => 504,
        codes::CALLING_DEPTH_EXCEEDED => 508,
        _ => 500,
    }
}

// =============================================================================
// RpcError
// =============================================================================

/// Typed application error and canonical wire shape.
///
/// Serializes as `{ code, status, message, details? }`. Adapters map `code` and
/// `status` onto their own conventions (HTTP status, JSON-RPC error codes,
/// WebSocket close codes); that mapping lives outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: String,
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RpcError {
    /// Create an error whose status comes from the code table.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let status = status_for_code(&code);
        Self {
            code,
            status,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the status derived from the code table.
    ///
    /// Values outside 400..=599 are clamped into that range.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status.clamp(400, 599);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_ARGUMENT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// True if this error carries the given code.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// Normalize a handler error for the caller.
    ///
    /// A typed `RpcError` anywhere in the chain passes through verbatim.
    /// Anything else becomes `fallback_code` with the error's message; the
    /// debug rendering of the chain is attached only when `expose_internal`
    /// is set (non-production builds).
    pub fn from_anyhow(error: &anyhow::Error, fallback_code: &str, expose_internal: bool) -> Self {
        if let Some(typed) = error.chain().find_map(|e| e.downcast_ref::<RpcError>()) {
            return typed.clone();
        }

        let normalized = Self::new(fallback_code, error.to_string());
        if expose_internal {
            normalized.with_details(serde_json::json!({ "stack": format!("{:?}", error) }))
        } else {
            normalized
        }
    }

    /// Rebuild a typed error from an error envelope payload.
    ///
    /// Payloads that are not in wire shape become `INTERNAL_ERROR`, keeping the
    /// raw payload as details.
    pub fn from_payload(payload: &Value) -> Self {
        match serde_json::from_value::<RpcError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => Self::internal("malformed error payload").with_details(payload.clone()),
        }
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        // A struct of strings, numbers and a Value cannot fail to serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Courier Error
// =============================================================================

/// Setup-time errors.
///
/// These never occur during dispatch; they surface while wiring a registry or
/// a router together.
#[derive(Debug, Error)]
pub enum CourierError {
    /// A handler is already registered under this name.
    #[error("handler already registered for {kind} {name}")]
    AlreadyRegistered {
        /// `procedure`, `stream` or `event`.
        kind: HandlerKind,
        /// The conflicting name.
        name: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },
}

/// The three registration shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Procedure,
    Stream,
    Event,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Procedure => write!(f, "procedure"),
            HandlerKind::Stream => write!(f, "stream"),
            HandlerKind::Event => write!(f, "event"),
        }
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
