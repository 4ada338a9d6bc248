use core::fmt::{Debug, Display, Formatter};
use std::io;

/// Error
#[derive(Debug)]
pub enum Error {
    UnexpectedType(u16),
    /// Includes the message type for trailing bytes
    TrailingBytes(usize, u16),
    ShortRead,
    Eof,
    MessageTooLarge(u32),
    /// A field did not decode to a sensible value
    BadValue(&'static str),
    BadTx(bitcoin::consensus::encode::Error),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bitcoin::consensus::encode::Error> for Error {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        Error::BadTx(e)
    }
}

/// Result
pub type Result<T> = core::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}
