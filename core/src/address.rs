use core::fmt;
use std::{net::SocketAddr, path::PathBuf};

/// Local or remote endpoint address, unified over inet and unix domain
/// transports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// Ip address and port of a tcp or udp endpoint.
    Inet(SocketAddr),
    /// Filesystem path of a unix socket.
    Path(PathBuf),
    /// Unnamed peer, e.g. an anonymous unix datagram sender.
    Unnamed,
}

impl Address {
    /// Socket address of an inet endpoint, if this is one.
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => addr.fmt(f),
            Self::Path(path) => path.display().fmt(f),
            Self::Unnamed => f.write_str("@"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

#[cfg(unix)]
impl From<&tokio::net::unix::SocketAddr> for Address {
    fn from(addr: &tokio::net::unix::SocketAddr) -> Self {
        match addr.as_pathname() {
            Some(path) => Self::Path(path.to_path_buf()),
            None => Self::Unnamed,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        let addr = Address::from("127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
        assert_eq!(Address::Path("/tmp/s.sock".into()).to_string(), "/tmp/s.sock");
        assert_eq!(Address::Unnamed.to_string(), "@");
    }

    #[test]
    fn as_inet() {
        let sa = "[::1]:9000".parse::<SocketAddr>().unwrap();
        assert_eq!(Address::from(sa).as_inet(), Some(sa));
        assert_eq!(Address::Unnamed.as_inet(), None);
    }
}
