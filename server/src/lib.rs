//! Socket servers for Tcp/Udp/UnixDomain handling behind one interface.
//!
//! Every transport exposes the same lifecycle: register a bind target
//! and a [`Handler`], call [`listen`] with a cancellation token, observe
//! connection and server events through the callback registry, and stop
//! through [`shutdown`] (drain, then stop listening) or [`close`].
//!
//! [`Handler`]: sockline_core::Handler
//! [`listen`]: Server::listen
//! [`shutdown`]: Server::shutdown
//! [`close`]: Server::close

#![forbid(unsafe_code)]

mod config;
mod shutdown;
mod stream;
mod tcp;
mod udp;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
mod unixgram;

use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use sockline_core::{Address, Error, FuncError, FuncInfo, FuncInfoServer, Handler, TlsContext};

pub use config::{MAX_GID, ServerConfig};
pub use tcp::TcpServer;
pub use udp::UdpServer;
#[cfg(unix)]
pub use unix::UnixServer;
#[cfg(unix)]
pub use unixgram::UnixgramServer;

/// A socket server, dispatching to the protocol picked by its
/// [`ServerConfig`].
#[derive(Clone)]
pub enum Server {
    Tcp(TcpServer),
    Udp(UdpServer),
    #[cfg(unix)]
    Unix(UnixServer),
    #[cfg(unix)]
    Unixgram(UnixgramServer),
}

macro_rules! dispatch {
    ($self:ident, $srv:ident => $body:expr) => {
        match $self {
            Server::Tcp($srv) => $body,
            Server::Udp($srv) => $body,
            #[cfg(unix)]
            Server::Unix($srv) => $body,
            #[cfg(unix)]
            Server::Unixgram($srv) => $body,
        }
    };
}

impl Server {
    /// Bind and serve until the server is stopped. Blocks the calling
    /// task; returns exactly one terminal error, or `Ok` after a clean
    /// caller-initiated stop.
    pub async fn listen(&self, token: CancellationToken) -> Result<(), Error> {
        dispatch!(self, srv => srv.listen(token).await)
    }

    /// Graceful stop: drain live connections, then stop the listener.
    pub async fn shutdown(&self) -> Result<(), Error> {
        dispatch!(self, srv => srv.shutdown().await)
    }

    /// Alias for [`Server::shutdown`].
    pub async fn close(&self) -> Result<(), Error> {
        dispatch!(self, srv => srv.close().await)
    }

    /// Stop accepting and wait for the accept/receive loop to exit.
    pub async fn stop_listen(&self) -> Result<(), Error> {
        dispatch!(self, srv => srv.stop_listen().await)
    }

    /// Refuse new connections and wait for live ones to finish.
    pub async fn stop_gone(&self) -> Result<(), Error> {
        dispatch!(self, srv => srv.stop_gone().await)
    }

    /// Install or clear TLS material. Only the Tcp server honors this;
    /// every other transport accepts it as a no-op.
    pub fn set_tls(&self, enable: bool, ctx: Option<&TlsContext>) -> Result<(), Error> {
        dispatch!(self, srv => srv.set_tls(enable, ctx))
    }

    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        dispatch!(self, srv => srv.register_handler(handler))
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        dispatch!(self, srv => srv.register_func_error(f))
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        dispatch!(self, srv => srv.register_func_info(f))
    }

    pub fn register_func_info_server(&self, f: Option<FuncInfoServer>) {
        dispatch!(self, srv => srv.register_func_info_server(f))
    }

    pub fn is_running(&self) -> bool {
        dispatch!(self, srv => srv.is_running())
    }

    pub fn is_gone(&self) -> bool {
        dispatch!(self, srv => srv.is_gone())
    }

    pub fn open_connections(&self) -> i64 {
        dispatch!(self, srv => srv.open_connections())
    }

    /// Address the server is actually bound to, once running.
    pub fn local_addr(&self) -> Option<Address> {
        dispatch!(self, srv => srv.local_addr())
    }

    /// Future resolving once the stop signal has been closed.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        dispatch!(self, srv => srv.done())
    }

    pub fn as_tcp(&self) -> Option<&TcpServer> {
        match self {
            Self::Tcp(srv) => Some(srv),
            _ => None,
        }
    }
}
