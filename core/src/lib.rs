//! Shared leaf types for the sockline socket framework.
//!
//! This crate carries everything the server and client crates have in
//! common: the connection lifecycle states reported to observability
//! callbacks, the callback registry itself, the handler contract, the
//! error taxonomy and the TLS context material consumed by Tcp
//! endpoints.

#![forbid(unsafe_code)]

mod address;
mod callback;
mod counter;
mod error;
mod handler;
mod state;
mod tls;

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use address::Address;
pub use callback::{Callbacks, FuncError, FuncInfo, FuncInfoServer};
pub use counter::{Counter, CounterGuard};
pub use error::{Error, error_filter, is_closed_noise};
pub use handler::{BoxFuture, FnHandler, Handler, Request, fn_handler};
pub use state::ConnState;
pub use tls::TlsContext;

/// Default buffer size for socket read operations (32 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// End-of-line delimiter terminating every payload handed to a handler.
pub const EOL: u8 = b'\n';

/// Network protocol selector used by server and client configs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
    Unixgram,
}

impl Protocol {
    /// Returns true for connection-oriented transports.
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Unix)
    }

    /// Returns true for unix domain transports, which require a
    /// POSIX-like platform.
    pub fn is_unix(self) -> bool {
        matches!(self, Self::Unix | Self::Unixgram)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Unix => "unix",
            Self::Unixgram => "unixgram",
        })
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "unix" => Ok(Self::Unix),
            "unixgram" => Ok(Self::Unixgram),
            _ => Err(Error::InvalidProtocol),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UnixGram".parse::<Protocol>().unwrap(), Protocol::Unixgram);
        assert!("dtls".parse::<Protocol>().is_err());
    }

    #[test]
    fn protocol_classes() {
        assert!(Protocol::Tcp.is_stream());
        assert!(Protocol::Unix.is_stream());
        assert!(!Protocol::Udp.is_stream());
        assert!(Protocol::Unixgram.is_unix());
        assert!(!Protocol::Tcp.is_unix());
    }
}
