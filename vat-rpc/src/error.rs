//! The one error type that crosses every handler boundary in this crate.
//!
//! Covers transport-missing, protocol violation, local-resolution errors
//! (capability unavailable / unknown export / promise broken / promise
//! unresolved / promised-answer missing), remote abort, and decode failure.
//! Each gets its own variant so call sites can match on a stable reason
//! string, the same strings compared against in `return.exception` frames.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no transport attached")]
    TransportMissing,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unknown capability")]
    UnknownCapability,

    #[error("unknown question")]
    UnknownQuestion,

    #[error("promise broken")]
    PromiseBroken,

    #[error("promised answer missing")]
    PromisedAnswerMissing,

    #[error("bootstrap not configured")]
    BootstrapNotConfigured,

    #[error("remote abort: {0}")]
    RemoteAbort(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// The string used as the `reason` of a `return.exception` (e.g.
    /// `"loopback"`, `"promise broken"`, `"unknown capability"`).
    pub fn reason(&self) -> String {
        match self {
            Error::TransportMissing => "no transport attached".to_string(),
            Error::Protocol(m) => m.clone(),
            Error::UnknownCapability => "unknown capability".to_string(),
            Error::UnknownQuestion => "unknown question".to_string(),
            Error::PromiseBroken => "promise broken".to_string(),
            Error::PromisedAnswerMissing => "promised answer missing".to_string(),
            Error::BootstrapNotConfigured => "bootstrap not configured".to_string(),
            Error::RemoteAbort(m) => format!("remote abort: {m}"),
            Error::Decode(m) => m.clone(),
            Error::Failed(m) => m.clone(),
        }
    }
}

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation canceled")
    }
}

/// A dropped oneshot receiver (the other end of a `SenderQueue` entry went
/// away) becomes a plain failed `Error`, never a panic.
#[derive(Debug, Clone, Copy)]
pub struct Canceled;

impl std::error::Error for Canceled {}

pub fn canceled_to_error(_: tokio::sync::oneshot::error::RecvError) -> Error {
    Error::failed("operation canceled")
}
