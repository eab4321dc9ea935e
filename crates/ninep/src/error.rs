//! Error representations for the library.
//!
//! 9P2000 reports failures as `Rerror` messages carrying a plain string.
//! [`Error::Remote`] holds such a string received from (or destined for) the
//! peer; [`Error::Io`] wraps transport failures; [`Error::Protocol`] covers
//! malformed frames and protocol-rule violations detected locally.

use std::fmt;
use std::io;

/// The error strings the protocol machinery itself produces.
///
/// User filesystems are free to respond with any text, but these cover the
/// conditions the dispatch loop and client facade detect on their own.
pub mod string {
    pub const EBADFCALL: &str = "bad fcall type";
    pub const EBOTCH: &str = "9P protocol botch";
    pub const EDUPFID: &str = "fid in use";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const EINTERRUPTED: &str = "interrupted";
    pub const ENOAUTH: &str = "authentication not required";
    pub const ENOFID: &str = "fid does not exist";
    pub const ENOFILE: &str = "file does not exist";
    pub const ENOFUNC: &str = "function not implemented";
}

#[derive(Debug)]
pub enum Error {
    /// Transport failure. The connection is unusable afterwards.
    Io(io::Error),
    /// An `Rerror` string, ours or the peer's.
    Remote(String),
    /// A violation of the wire protocol detected locally.
    Protocol(String),
}

impl Error {
    /// The text to place in an `Rerror` reply for this error.
    pub fn ename(&self) -> String {
        match self {
            Error::Io(e) => e.to_string(),
            Error::Remote(s) => s.clone(),
            Error::Protocol(s) => s.clone(),
        }
    }

    /// Error delivered to every waiter when a client connection dies.
    pub(crate) fn disconnected() -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection torn down",
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Remote(s) => write!(f, "{}", s),
            Error::Protocol(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::Remote(s.to_owned())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Remote(s)
    }
}
