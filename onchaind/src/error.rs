use core::fmt::{Display, Formatter};

use onchain_protocol::model::FailureKind;

/// Fatal engine error.  There is no local recovery: every variant
/// terminates the daemon, and the parent restarts it from persisted
/// channel state if it wants another attempt.
#[derive(Debug)]
pub enum Error {
    /// The parent delivered a malformed or unexpected message
    BadCommand(String),
    /// A protocol invariant was violated
    InternalError(String),
    /// A key-derivation step failed
    CryptoFailed(String),
    /// The wire itself failed
    Wire(onchain_protocol::Error),
}

impl Error {
    /// Failure category for the status report to the parent
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::BadCommand(_) => FailureKind::BadCommand,
            Error::InternalError(_) => FailureKind::InternalError,
            Error::CryptoFailed(_) => FailureKind::CryptoFailed,
            Error::Wire(_) => FailureKind::BadCommand,
        }
    }
}

impl From<onchain_protocol::Error> for Error {
    fn from(e: onchain_protocol::Error) -> Self {
        Error::Wire(e)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadCommand(m) => write!(f, "bad command: {}", m),
            Error::InternalError(m) => write!(f, "internal error: {}", m),
            Error::CryptoFailed(m) => write!(f, "crypto failed: {}", m),
            Error::Wire(e) => write!(f, "wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result
pub type Result<T> = core::result::Result<T, Error>;
