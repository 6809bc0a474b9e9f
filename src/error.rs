//! The errors of this crate.

use core::fmt;
use std::io;

use crate::coap::Code;

/// The error type for every fallible operation of the agent and its
/// protocol layers.
#[derive(Debug)]
pub enum Error {
    /// UDP or DTLS socket failure.
    Transport(io::Error),
    /// Cookie, hello or verify-data breakage during the DTLS handshake.
    Handshake(&'static str),
    /// Record MAC mismatch, or a record shorter than its authentication tag.
    Decrypt,
    /// Malformed CoAP or TLV data, or an unexpected code.
    Protocol(String),
    /// A register, update or bootstrap wait elapsed.
    Timeout(&'static str),
    /// The resource store signalled a non-success code.
    Handler(Code),
    /// The addressed object, instance or resource does not exist.
    NotFound,
    /// The operation is not permitted on the addressed entity.
    NotAllowed,
    /// Configuration or object catalogue problem; fatal to the caller.
    Config(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Transport(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::Handshake(s) => write!(f, "DTLS handshake failed: {}", s),
            Error::Decrypt => write!(f, "record failed verification"),
            Error::Protocol(s) => write!(f, "protocol error: {}", s),
            Error::Timeout(what) => write!(f, "{} timed out", what),
            Error::Handler(code) => {
                write!(f, "resource store answered {}", code)
            }
            Error::NotFound => write!(f, "not found"),
            Error::NotAllowed => write!(f, "not allowed"),
            Error::Config(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}
