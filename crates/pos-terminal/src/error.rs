//! Error types for the transaction engine

use std::time::Duration;

use pos_common::TlvError;
use thiserror::Error;

use crate::authorization::AuthorizationError;
use crate::crypto::PinBlockError;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("malformed TLV: {0}")]
    MalformedTlv(#[from] TlvError),

    #[error("reader did not answer within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("reader is not connected")]
    NotConnected,

    #[error("reader is already connected")]
    AlreadyConnected,

    #[error("no reader device detected")]
    NoDevice,

    #[error("reader disconnected")]
    Disconnected,

    #[error("a trade is already in progress")]
    TradeInProgress,

    #[error("no trade in progress")]
    NoTradeInProgress,

    #[error("hardware error: {0}")]
    HardwareError(String),

    #[error("transaction cancelled")]
    TransactionCancelled,

    #[error("transaction declined: {0}")]
    TransactionDeclined(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("PIN block error: {0}")]
    PinBlock(#[from] PinBlockError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TerminalError {
    pub fn hardware(message: impl Into<String>) -> Self {
        TerminalError::HardwareError(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TerminalError::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        TerminalError::Config(message.into())
    }
}

impl From<AuthorizationError> for TerminalError {
    fn from(err: AuthorizationError) -> Self {
        match err {
            AuthorizationError::Network(msg) => TerminalError::NetworkFailure(msg),
            AuthorizationError::Timeout(after) => {
                TerminalError::NetworkFailure(format!("issuer did not answer within {after:?}"))
            }
            AuthorizationError::Rejected(msg) => TerminalError::TransactionDeclined(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, TerminalError>;
