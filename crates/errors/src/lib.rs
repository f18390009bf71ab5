//! The client-facing error taxonomy for the sync protocol.
//!
//! A `ProtocolError` can be attached to an `anyhow` error chain via
//! `.context(..)`. Service top-levels recover it with
//! [`ErrorBodyAnyhowExt`] to decide what to send on the socket, which close
//! frame to use, and at which level to log. Errors with no `ProtocolError`
//! in their chain are surfaced to clients as a generic `Internal` error.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::Level;
use tungstenite::protocol::{
    frame::coding::CloseCode,
    CloseFrame,
};

/// WebSocket close reasons must fit in a single control frame: 125 bytes
/// minus the 2-byte close code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

#[cfg_attr(
    any(test, feature = "testing"),
    derive(proptest_derive::Arbitrary, PartialOrd, Ord)
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthInvalidated,
    ClientNotFound,
    InvalidConnectionRequest,
    InvalidConnectionRequestBaseCookie,
    InvalidConnectionRequestLastMutationID,
    InvalidConnectionRequestClientDeleted,
    InvalidMessage,
    InvalidPush,
    PushFailed,
    TransformFailed,
    MutationFailed,
    MutationRateLimited,
    Rebalance,
    Rehome,
    Unauthorized,
    VersionNotSupported,
    SchemaVersionNotSupported,
    ServerOverloaded,
    Internal,
}

impl ErrorKind {
    /// Kinds that instruct the client to back off and reconnect, carrying
    /// optional `minBackoffMs` / `maxBackoffMs` / `reconnectParams` hints.
    pub fn is_backoff(&self) -> bool {
        matches!(
            self,
            ErrorKind::Rebalance | ErrorKind::Rehome | ErrorKind::ServerOverloaded
        )
    }

    /// Kinds for which the socket is closed with a protocol-error close code
    /// rather than a normal closure.
    pub fn is_protocol_restart(&self) -> bool {
        matches!(self, ErrorKind::InvalidMessage | ErrorKind::Internal)
    }

    /// Default log level for errors of this kind when none was attached.
    /// Everything that reflects client misuse of the protocol logs at warn.
    pub fn default_log_level(&self) -> Level {
        match self {
            ErrorKind::Internal => Level::ERROR,
            _ => Level::WARN,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the push pipeline produced the error.
#[cfg_attr(
    any(test, feature = "testing"),
    derive(proptest_derive::Arbitrary, PartialOrd, Ord)
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorOrigin {
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "zero-cache")]
    ZeroCache,
}

/// The wire form of an error, sent to clients as the body of an `error`
/// message or a close-frame reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub origin: ErrorOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_params: Option<BTreeMap<String, String>>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: ErrorOrigin::ZeroCache,
            min_backoff_ms: None,
            max_backoff_ms: None,
            reconnect_params: None,
        }
    }

    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn auth_invalidated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthInvalidated, message)
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMessage, message)
    }

    pub fn invalid_push(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPush, message)
    }

    pub fn push_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PushFailed, message)
    }

    pub fn transform_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransformFailed, message)
    }

    pub fn mutation_rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MutationRateLimited, message)
    }

    pub fn version_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VersionNotSupported, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// An operational hint instructing the client to reconnect elsewhere
    /// after a randomized delay in `[min_backoff_ms, max_backoff_ms]`.
    pub fn backoff(
        kind: ErrorKind,
        message: impl Into<String>,
        min_backoff_ms: u64,
        max_backoff_ms: u64,
        reconnect_params: BTreeMap<String, String>,
    ) -> Self {
        assert!(kind.is_backoff(), "{kind} is not a backoff kind");
        Self {
            kind,
            message: message.into(),
            origin: ErrorOrigin::ZeroCache,
            min_backoff_ms: Some(min_backoff_ms),
            max_backoff_ms: Some(max_backoff_ms),
            reconnect_params: Some(reconnect_params),
        }
    }

    /// The close frame for tearing down a socket with this error.
    pub fn close_frame(&self) -> CloseFrame {
        let code = if self.kind.is_protocol_restart() {
            CloseCode::Protocol
        } else {
            CloseCode::Policy
        };
        CloseFrame {
            code,
            reason: clamp_close_reason(&self.message).into_owned().into(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A classified error with an explicit log level, preserved through
/// wrap/unwrap along an `anyhow` chain.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{body}")]
pub struct ProtocolError {
    pub body: ErrorBody,
    pub level: Level,
}

impl ProtocolError {
    pub fn new(body: ErrorBody) -> Self {
        let level = body.kind.default_log_level();
        Self { body, level }
    }

    pub fn with_level(body: ErrorBody, level: Level) -> Self {
        Self { body, level }
    }

    pub fn kind(&self) -> ErrorKind {
        self.body.kind
    }
}

impl From<ErrorBody> for ProtocolError {
    fn from(body: ErrorBody) -> Self {
        Self::new(body)
    }
}

/// Clamp a close reason to `MAX_CLOSE_REASON_BYTES`, respecting UTF-8
/// character boundaries.
pub fn clamp_close_reason(reason: &str) -> Cow<'_, str> {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return Cow::Borrowed(reason);
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Borrowed(&reason[..end])
}

pub trait ErrorBodyAnyhowExt {
    /// The strongest classification present in the chain, if any.
    fn error_body(&self) -> Option<&ErrorBody>;

    /// The wire error for this chain, substituting `Internal` when the chain
    /// carries no classification. The internal message is not forwarded
    /// verbatim to avoid leaking server details.
    fn wire_error_body(&self) -> ErrorBody;

    fn log_level(&self) -> Level;

    fn close_frame(&self) -> CloseFrame;
}

impl ErrorBodyAnyhowExt for anyhow::Error {
    fn error_body(&self) -> Option<&ErrorBody> {
        self.chain()
            .find_map(|cause| cause.downcast_ref::<ProtocolError>())
            .map(|e| &e.body)
    }

    fn wire_error_body(&self) -> ErrorBody {
        match self.error_body() {
            Some(body) => body.clone(),
            None => ErrorBody::internal("Unexpected internal error"),
        }
    }

    fn log_level(&self) -> Level {
        self.chain()
            .find_map(|cause| cause.downcast_ref::<ProtocolError>())
            .map(|e| e.level)
            .unwrap_or(Level::ERROR)
    }

    fn close_frame(&self) -> CloseFrame {
        self.wire_error_body().close_frame()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use must_let::must_let;
    use tracing::Level;

    use crate::{
        clamp_close_reason,
        ErrorBody,
        ErrorBodyAnyhowExt,
        ErrorKind,
        ProtocolError,
        MAX_CLOSE_REASON_BYTES,
    };

    #[test]
    fn test_clamp_close_reason_char_boundary() {
        let reason = "é".repeat(100);
        let clamped = clamp_close_reason(&reason);
        assert!(clamped.len() <= MAX_CLOSE_REASON_BYTES);
        // 61 two-byte chars = 122 bytes; byte 123 falls mid-character.
        assert_eq!(clamped.chars().count(), 61);
        assert_eq!(clamp_close_reason("short"), "short");
    }

    #[test]
    fn test_wire_shape() {
        let body = ErrorBody::unauthorized("Client groups are pinned to a single user");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "Unauthorized");
        assert_eq!(json["origin"], "zero-cache");
        assert!(json.get("minBackoffMs").is_none());

        let body = ErrorBody::backoff(
            ErrorKind::Rebalance,
            "shard moving",
            50,
            5000,
            Default::default(),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["minBackoffMs"], 50);
        assert_eq!(json["maxBackoffMs"], 5000);
    }

    #[test]
    fn test_level_preserved_through_anyhow_chain() {
        let err = anyhow::anyhow!("inner io failure")
            .context(ProtocolError::with_level(
                ErrorBody::auth_invalidated("token superseded"),
                Level::INFO,
            ))
            .context("while updating auth");
        assert_eq!(err.log_level(), Level::INFO);
        must_let!(let Some(body) = err.error_body());
        assert_eq!(body.kind, ErrorKind::AuthInvalidated);
    }

    #[test]
    fn test_unclassified_chain_is_internal() {
        let err = anyhow::anyhow!("smashed invariant");
        let body = err.wire_error_body();
        assert_eq!(body.kind, ErrorKind::Internal);
        assert_eq!(err.log_level(), Level::ERROR);
        assert!(err.error_body().is_none());
    }
}
