use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use sockline_core::{DEFAULT_BUFFER_SIZE, Error, Handler, Protocol, TlsContext};

use crate::Server;
use crate::tcp::TcpServer;
use crate::udp::UdpServer;
#[cfg(unix)]
use crate::unix::UnixServer;
#[cfg(unix)]
use crate::unixgram::UnixgramServer;

/// Largest group id accepted for unix socket ownership.
pub const MAX_GID: u32 = 32767;

/// Declarative server configuration, deserializable from any serde
/// format.
///
/// `address` is a `host:port` pair for inet protocols and a filesystem
/// path for unix domain ones. `perm_file` and `group_perm` only apply
/// to unix domain sockets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: Protocol,
    pub address: String,
    pub perm_file: Option<u32>,
    pub group_perm: Option<u32>,
    pub timeout_idle: Option<Duration>,
    pub buffer_size: Option<usize>,
    pub enable_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: Protocol::Tcp,
            address: String::new(),
            perm_file: None,
            group_perm: None,
            timeout_idle: None,
            buffer_size: None,
            enable_tls: false,
        }
    }
}

impl ServerConfig {
    /// Check the configuration without allocating any socket.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.is_empty() {
            return Err(Error::InvalidAddress);
        }

        if self.network.is_unix() && !cfg!(unix) {
            return Err(Error::InvalidProtocol);
        }

        if let Some(gid) = self.group_perm {
            if gid > MAX_GID {
                return Err(Error::InvalidGroup);
            }
        }

        if self.enable_tls && self.network != Protocol::Tcp {
            return Err(Error::InvalidTlsConfig);
        }

        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    /// Build the server matching `network`, wired to `handler`. `tls`
    /// is consulted only when `enable_tls` is set, which is valid for
    /// Tcp alone. The returned server is configured but not yet
    /// listening.
    pub fn build(&self, handler: Arc<dyn Handler>, tls: Option<&TlsContext>) -> Result<Server, Error> {
        self.validate()?;

        match self.network {
            Protocol::Tcp => {
                let srv = TcpServer::with_options(self.buffer_size(), self.timeout_idle);
                srv.register_server(&self.address)?;
                srv.register_handler(handler);
                if self.enable_tls {
                    srv.set_tls(true, tls)?;
                }
                Ok(Server::Tcp(srv))
            }
            Protocol::Udp => {
                let srv = UdpServer::with_options(self.buffer_size());
                srv.register_server(&self.address)?;
                srv.register_handler(handler);
                Ok(Server::Udp(srv))
            }
            #[cfg(unix)]
            Protocol::Unix => {
                let srv = UnixServer::with_options(self.buffer_size(), self.timeout_idle);
                srv.register_socket(&self.address, self.perm_file, self.group_perm)?;
                srv.register_handler(handler);
                Ok(Server::Unix(srv))
            }
            #[cfg(unix)]
            Protocol::Unixgram => {
                let srv = UnixgramServer::with_options(self.buffer_size());
                srv.register_socket(&self.address, self.perm_file, self.group_perm)?;
                srv.register_handler(handler);
                Ok(Server::Unixgram(srv))
            }
            #[cfg(not(unix))]
            Protocol::Unix | Protocol::Unixgram => Err(Error::InvalidProtocol),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use sockline_core::{BoxFuture, Request};

    use super::*;

    struct Nop;

    impl Handler for Nop {
        fn handle<'a>(&'a self, _: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn empty_address_is_invalid() {
        let cfg = ServerConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::InvalidAddress)));
    }

    #[test]
    fn group_over_limit_is_invalid() {
        let cfg = ServerConfig {
            network: Protocol::Unix,
            address: "/tmp/sockline.sock".into(),
            group_perm: Some(MAX_GID + 1),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidGroup)));
    }

    #[test]
    fn builds_tcp_server() {
        let cfg = ServerConfig {
            address: "127.0.0.1:0".into(),
            ..Default::default()
        };

        let srv = cfg.build(Arc::new(Nop), None).unwrap();
        assert!(srv.as_tcp().is_some());
        assert!(!srv.is_running());
    }

    #[test]
    fn tls_enabled_without_material_is_rejected() {
        let cfg = ServerConfig {
            address: "127.0.0.1:0".into(),
            enable_tls: true,
            ..Default::default()
        };

        // no context at all, then a context with no certificate pair.
        assert!(matches!(cfg.build(Arc::new(Nop), None), Err(Error::InvalidTlsConfig)));
        assert!(matches!(
            cfg.build(Arc::new(Nop), Some(&TlsContext::new())),
            Err(Error::InvalidTlsConfig)
        ));
    }

    #[test]
    fn tls_is_tcp_only() {
        let cfg = ServerConfig {
            network: Protocol::Udp,
            address: "127.0.0.1:9000".into(),
            enable_tls: true,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidTlsConfig)));
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{ "network": "udp", "address": "127.0.0.1:9000", "buffer_size": 2048 }"#)
                .unwrap();
        assert_eq!(cfg.network, Protocol::Udp);
        assert_eq!(cfg.buffer_size, Some(2048));
        cfg.validate().unwrap();
    }
}
