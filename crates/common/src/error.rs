//! Error types for the IPC substrate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared segment '{0}' does not exist")]
    SegmentMissing(String),

    #[error("shared segment '{name}' is {len} bytes, expected at least {expected}")]
    SegmentTruncated {
        name: String,
        len: usize,
        expected: usize,
    },

    #[error("ring '{0}' has a bad magic word; segment is not a wsmux ring")]
    BadMagic(String),

    #[error("another broker owns the shared queues: pid {0}")]
    OwnerContended(u64),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0}")]
    Generic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}
