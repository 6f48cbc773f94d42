//! Client library error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ipc(#[from] common::Error),

    #[error("not connected to a broker")]
    NotConnected,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("broker rejected the request: {0}")]
    Rejected(String),

    #[error("{field} is {len} bytes; the wire caps it at {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
