use core::fmt;
use std::{error, io};

/// Error type shared by sockline servers and clients.
///
/// Configuration and validation errors are returned synchronously from
/// the call that detected them. Operational errors raised inside accept,
/// receive or connection loops are routed to the registered error
/// callback instead and never abort the loop unless the listener itself
/// is gone.
#[derive(Debug)]
pub enum Error {
    /// Bind target is empty or cannot be resolved.
    InvalidAddress,
    /// No handler was registered before `listen`.
    InvalidHandler,
    /// Operation on an unconstructed or torn-down instance.
    InvalidInstance,
    /// Unix group id exceeds the platform range.
    InvalidGroup,
    /// Protocol is unknown or unsupported on this platform.
    InvalidProtocol,
    /// TLS context is missing, has no certificate pair, or does not
    /// resolve to a usable configuration.
    InvalidTlsConfig,
    /// Listener did not stop within the stop-listen window.
    ShutdownTimeout,
    /// Connections did not drain within the drain window.
    GoneTimeout,
    /// Server or connection has already been stopped.
    ServerClosed,
    /// Supplied cancellation token was already cancelled.
    ContextClosed,
    /// Underlying transport error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress => f.write_str("invalid or missing listen address"),
            Self::InvalidHandler => f.write_str("no handler registered"),
            Self::InvalidInstance => f.write_str("invalid server instance"),
            Self::InvalidGroup => f.write_str("unix group id out of range"),
            Self::InvalidProtocol => f.write_str("invalid or unsupported network protocol"),
            Self::InvalidTlsConfig => f.write_str("invalid tls configuration"),
            Self::ShutdownTimeout => f.write_str("timeout waiting for listener to stop"),
            Self::GoneTimeout => f.write_str("timeout waiting for connections to drain"),
            Self::ServerClosed => f.write_str("server is closed"),
            Self::ContextClosed => f.write_str("cancellation context is already closed"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Whether an io error is expected noise from closing our own endpoint,
/// e.g. a write against a socket we already shut down.
pub fn is_closed_noise(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotConnected) || e.to_string().contains("closed")
}

/// Drop well-known benign close errors, keeping everything else.
///
/// Used before surfacing operational errors to the error callback so an
/// intentional shutdown does not produce noise.
pub fn error_filter(e: io::Error) -> Option<io::Error> {
    if is_closed_noise(&e) { None } else { Some(e) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_suppresses_closed_noise() {
        let e = io::Error::other("use of closed network connection");
        assert!(error_filter(e).is_none());

        let e = io::Error::from(io::ErrorKind::NotConnected);
        assert!(error_filter(e).is_none());
    }

    #[test]
    fn filter_keeps_real_errors() {
        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(error_filter(e).is_some());
    }

    #[test]
    fn io_source_is_preserved() {
        use std::error::Error as _;

        let e = Error::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(e.source().is_some());
        assert!(Error::GoneTimeout.source().is_none());
    }
}
