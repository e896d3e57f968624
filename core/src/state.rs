use core::fmt;

/// Lifecycle phase of a connection, reported to the info callback.
///
/// States are purely observational and never drive control flow. For a
/// single stream connection events arrive in the strict order
/// `New → (Read/Handler/Write)* → CloseRead/CloseWrite → Close`.
/// Datagram servers only ever report `Read` and `Handler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// A client is dialing a remote endpoint.
    Dial,
    /// A new connection has been established.
    New,
    /// Data is being read from the connection.
    Read,
    /// The read side of the connection is closing.
    CloseRead,
    /// The registered handler is running.
    Handler,
    /// Data is being written to the connection.
    Write,
    /// The write side of the connection is closing.
    CloseWrite,
    /// The connection is fully closing.
    Close,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dial => "Dial Connection",
            Self::New => "New Connection",
            Self::Read => "Read Incoming Stream",
            Self::CloseRead => "Close Incoming Stream",
            Self::Handler => "Run Handler",
            Self::Write => "Write Outgoing Stream",
            Self::CloseWrite => "Close Outgoing Stream",
            Self::Close => "Close Connection",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(ConnState::New.to_string(), "New Connection");
        assert_eq!(ConnState::Handler.to_string(), "Run Handler");
        assert_eq!(ConnState::Close.to_string(), "Close Connection");
    }
}
