pub mod net;

use thiserror::Error;

pub use crate::core::Transport;
pub use net::{NetTransport, TlsTrust};

/// Failures raised by a transport while opening, writing or reading.
///
/// Every variant is considered transient by the dispatcher.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("operation timed out")]
    TimedOut,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("transport is not open")]
    NotOpen,

    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Maps IO errors that mean "the other side went away" to `ConnectionClosed`.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::TimedOut,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}
