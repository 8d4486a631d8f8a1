use std::io;

use thiserror::Error;

use crate::message::SipMethod;
use crate::transaction::key::TsxKey;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transaction layer.
///
/// Every failure mode is its own variant so callers can classify errors
/// without inspecting message strings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("transaction not found: {0}")]
    TransactionNotFound(TsxKey),

    #[error("transaction timed out: {0}")]
    TransactionTimedOut(TsxKey),

    #[error("transaction already terminated: {0}")]
    TransactionTerminated(TsxKey),

    #[error("a transaction with key {0} already exists")]
    DuplicateTransaction(TsxKey),

    #[error("transaction manager is closed")]
    ManagerClosed,

    #[error("transport closed")]
    TransportClosed,

    #[error("no target address could be derived")]
    NoTarget,

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(SipMethod),

    #[error("message did not match any transaction")]
    MessageNotMatched,

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::fsm::State,
        to: crate::fsm::State,
    },

    #[error("send aborted by cancellation")]
    Canceled,

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Snapshot(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the inbound message that produced this error was malformed,
    /// as opposed to the failure being internal. Drives the 400-versus-500
    /// choice when the manager rejects a request.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::InvalidMessage(_) | Error::MethodNotAllowed(_)
        )
    }

    /// Whether this error reports a transaction-layer timeout (Timer B/F/H).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransactionTimedOut(_))
    }
}
