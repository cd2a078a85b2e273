use crate::id::LengthError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dht worker has shut down")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("invalid bencode data")]
    Decode(#[from] serde_bencode::Error),
    #[error("invalid identifier")]
    InvalidId(#[from] LengthError),
    #[error("remote node rejected the request: {0}")]
    Rejected(String),
    #[error("socket error")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
