//! Two-level error model for connection I/O, mirroring the
//! `NetworkError::{Wait, Fatal}` split used throughout `neutronium::net`.
//! `Wait` means "nothing went wrong, just not enough data/capacity yet";
//! `Fatal` means the owning connection must be closed.

use std::fmt;
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    Io,
    Protocol,
    ClusterDown,
    PeerClosed,
}

#[derive(Debug)]
pub enum ProxyError {
    Wait,
    Fatal(FaultKind),
}

impl ProxyError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Fatal(_))
    }

    pub fn protocol() -> ProxyError {
        ProxyError::Fatal(FaultKind::Protocol)
    }

    pub fn cluster_down() -> ProxyError {
        ProxyError::Fatal(FaultKind::ClusterDown)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Wait => write!(f, "would block"),
            ProxyError::Fatal(kind) => write!(f, "fatal error: {:?}", kind),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> ProxyError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ProxyError::Wait,
            _ => ProxyError::Fatal(FaultKind::Io),
        }
    }
}

impl From<crate::frame::ProtocolError> for ProxyError {
    fn from(_: crate::frame::ProtocolError) -> ProxyError {
        ProxyError::Fatal(FaultKind::Protocol)
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
