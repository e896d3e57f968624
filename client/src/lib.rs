//! Socket clients for Tcp/Udp/UnixDomain endpoints behind one interface.
//!
//! Every transport supports a persistent connection (`connect`, `write`,
//! `read`, `close`) plus one-shot exchanges (`once`, `request`) that
//! dial fresh, send the request and collect the reply. Connection
//! phases are observable through the same callback registry the servers
//! use.

#![forbid(unsafe_code)]

mod stream;
mod tcp;
mod udp;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
mod unixgram;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sockline_core::{Error, FuncError, FuncInfo, Protocol, TlsContext};

pub use tcp::TcpClient;
pub use udp::UdpClient;
#[cfg(unix)]
pub use unix::UnixClient;
#[cfg(unix)]
pub use unixgram::UnixgramClient;

/// A socket client, dispatching to the protocol picked by its
/// [`ClientConfig`].
#[derive(Clone)]
pub enum Client {
    Tcp(TcpClient),
    Udp(UdpClient),
    #[cfg(unix)]
    Unix(UnixClient),
    #[cfg(unix)]
    Unixgram(UnixgramClient),
}

macro_rules! dispatch {
    ($self:ident, $cli:ident => $body:expr) => {
        match $self {
            Client::Tcp($cli) => $body,
            Client::Udp($cli) => $body,
            #[cfg(unix)]
            Client::Unix($cli) => $body,
            #[cfg(unix)]
            Client::Unixgram($cli) => $body,
        }
    };
}

impl Client {
    /// Dial and keep the connection for later reads and writes.
    pub async fn connect(&self) -> Result<(), Error> {
        dispatch!(self, cli => cli.connect().await)
    }

    pub fn is_connected(&self) -> bool {
        dispatch!(self, cli => cli.is_connected())
    }

    /// Write `payload` on the persistent connection.
    pub async fn write(&self, payload: &[u8]) -> Result<(), Error> {
        dispatch!(self, cli => cli.write(payload).await)
    }

    /// Read at most `buf.len()` bytes from the persistent connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        dispatch!(self, cli => cli.read(buf).await)
    }

    /// Close the persistent connection, if any.
    pub async fn close(&self) -> Result<(), Error> {
        dispatch!(self, cli => cli.close().await)
    }

    /// One-shot exchange handing the complete reply to `reader`.
    pub async fn once<F>(&self, request: &[u8], reader: F) -> Result<(), Error>
    where
        F: FnOnce(&[u8]),
    {
        dispatch!(self, cli => cli.once(request, reader).await)
    }

    /// One-shot exchange returning the reply as owned bytes.
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes, Error> {
        dispatch!(self, cli => cli.request(payload).await)
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        dispatch!(self, cli => cli.register_func_error(f))
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        dispatch!(self, cli => cli.register_func_info(f))
    }

    pub fn as_tcp(&self) -> Option<&TcpClient> {
        match self {
            Self::Tcp(cli) => Some(cli),
            _ => None,
        }
    }
}

/// Declarative client configuration, deserializable from any serde
/// format. `server_name` overrides the TLS certificate name to verify;
/// it defaults to the host part of `address`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: Protocol,
    pub address: String,
    pub timeout: Option<Duration>,
    pub buffer_size: Option<usize>,
    pub enable_tls: bool,
    pub server_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Protocol::Tcp,
            address: String::new(),
            timeout: None,
            buffer_size: None,
            enable_tls: false,
            server_name: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.is_empty() {
            return Err(Error::InvalidAddress);
        }
        if self.network.is_unix() && !cfg!(unix) {
            return Err(Error::InvalidProtocol);
        }
        if self.enable_tls && self.network != Protocol::Tcp {
            return Err(Error::InvalidTlsConfig);
        }
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(sockline_core::DEFAULT_BUFFER_SIZE)
    }

    fn server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name,
            None => self.address.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.address),
        }
    }

    /// Build the client matching `network`. `tls` is consulted only
    /// when `enable_tls` is set, which is valid for Tcp alone.
    pub fn build(&self, tls: Option<&TlsContext>) -> Result<Client, Error> {
        self.validate()?;

        match self.network {
            Protocol::Tcp => {
                let cli = TcpClient::new();
                cli.register_server(&self.address)?;
                if self.enable_tls {
                    cli.set_tls(true, tls, self.server_name())?;
                }
                Ok(Client::Tcp(cli))
            }
            Protocol::Udp => {
                let cli = UdpClient::with_options(self.buffer_size(), self.timeout);
                cli.register_server(&self.address)?;
                Ok(Client::Udp(cli))
            }
            #[cfg(unix)]
            Protocol::Unix => {
                let cli = UnixClient::new();
                cli.register_socket(&self.address)?;
                Ok(Client::Unix(cli))
            }
            #[cfg(unix)]
            Protocol::Unixgram => {
                let cli = UnixgramClient::with_options(self.buffer_size(), self.timeout);
                cli.register_socket(&self.address)?;
                Ok(Client::Unixgram(cli))
            }
            #[cfg(not(unix))]
            Protocol::Unix | Protocol::Unixgram => Err(Error::InvalidProtocol),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_address_is_invalid() {
        let cfg = ClientConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::InvalidAddress)));
    }

    #[test]
    fn tls_is_tcp_only() {
        let cfg = ClientConfig {
            network: Protocol::Udp,
            address: "127.0.0.1:9000".into(),
            enable_tls: true,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidTlsConfig)));
    }

    #[test]
    fn server_name_defaults_to_host() {
        let cfg = ClientConfig {
            address: "example.com:7000".into(),
            ..Default::default()
        };
        assert_eq!(cfg.server_name(), "example.com");

        let named = ClientConfig {
            server_name: Some("other.example.com".into()),
            ..cfg
        };
        assert_eq!(named.server_name(), "other.example.com");
    }

    #[test]
    fn builds_tcp_client() {
        let cfg = ClientConfig {
            address: "127.0.0.1:7000".into(),
            ..Default::default()
        };
        let cli = cfg.build(None).unwrap();
        assert!(cli.as_tcp().is_some());
        assert!(!cli.is_connected());
    }
}
