use std::num::ParseIntError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the channel or transport is closed.
    #[error("the channel is closed")]
    ErrClosed,

    /// Indicates a send was attempted with no writable connection selected.
    #[error("no writable connection, would block")]
    ErrSendPacket,

    /// Indicates a connection for the remote address already exists.
    #[error("connection with same remote address already exists")]
    ErrConnectionAddrAlreadyExist,

    /// Indicates the local username fragment is shorter than 4 characters.
    #[error("ufrag is shorter than 4 characters")]
    ErrUfragTooShort,

    /// Indicates the local password is shorter than 22 characters.
    #[error("pwd is shorter than 22 characters")]
    ErrPwdTooShort,

    /// Indicates a channel with the given name does not exist.
    #[error("no channel with that name")]
    ErrChannelNotFound,

    /// Indicates a channel with the given name already exists.
    #[error("channel with same name already exists")]
    ErrChannelAlreadyExists,

    /// Indicates the proxy has no bound implementation yet.
    #[error("channel has no implementation bound")]
    ErrChannelUnbound,

    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("unknown protocol type")]
    ErrUnknownProtocolType,
    #[error("unknown role")]
    ErrUnknownRole,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("transport description namespace not recognized")]
    ErrUnknownTransportType,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}
