use std::{
    net::ToSocketAddrs,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{self, pki_types::ServerName},
};
use tracing::debug;

use sockline_core::{
    Address, Callbacks, ConnState, Error, FuncError, FuncInfo, TlsContext, error_filter,
};

use crate::stream::{MaybeTls, exchange};

struct Tls {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

struct Inner {
    address: RwLock<Option<String>>,
    tls: RwLock<Option<Arc<Tls>>>,
    events: Arc<Callbacks>,
    conn: tokio::sync::Mutex<Option<MaybeTls>>,
}

/// Tcp client, optionally wrapped in TLS.
///
/// Supports both a persistent connection ([`TcpClient::connect`] then
/// [`TcpClient::write`]/[`TcpClient::read`]) and one-shot exchanges
/// ([`TcpClient::once`]/[`TcpClient::request`]) that dial, write,
/// half-close and drain the reply on a fresh connection.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<Inner>,
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                address: RwLock::new(None),
                tls: RwLock::new(None),
                events: Arc::new(Callbacks::new()),
                conn: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Validate and store the server address.
    pub fn register_server(&self, address: &str) -> Result<(), Error> {
        if address.is_empty() {
            return Err(Error::InvalidAddress);
        }

        address
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;

        store(&self.inner.address, Some(address.to_owned()));
        Ok(())
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        self.inner.events.register_error(f);
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        self.inner.events.register_info(f);
    }

    /// Install or clear TLS material for subsequent dials. Enabling
    /// requires a context with roots (or certificates) and a server
    /// name the presented certificate must match.
    pub fn set_tls(&self, enable: bool, ctx: Option<&TlsContext>, server_name: &str) -> Result<(), Error> {
        if !enable {
            store(&self.inner.tls, None);
            return Ok(());
        }

        let ctx = ctx.ok_or(Error::InvalidTlsConfig)?;
        let config = ctx.client_config()?;
        let server_name = ServerName::try_from(server_name.to_owned()).map_err(|_| Error::InvalidTlsConfig)?;

        store(
            &self.inner.tls,
            Some(Arc::new(Tls {
                config: Arc::new(config),
                server_name,
            })),
        );
        Ok(())
    }

    fn address(&self) -> Result<String, Error> {
        load(&self.inner.address).ok_or(Error::InvalidAddress)
    }

    async fn dial(&self) -> Result<(MaybeTls, Address, Address), Error> {
        let address = self.address()?;

        let remote = Address::from(
            address
                .to_socket_addrs()
                .map_err(|_| Error::InvalidAddress)?
                .next()
                .ok_or(Error::InvalidAddress)?,
        );
        self.inner.events.info(&Address::Unnamed, &remote, ConnState::Dial);

        let stream = TcpStream::connect(address.as_str()).await?;
        let conn = match load(&self.inner.tls) {
            Some(tls) => {
                let connector = TlsConnector::from(tls.config.clone());
                let stream = connector.connect(tls.server_name.clone(), stream).await?;
                MaybeTls::Tls { io: stream }
            }
            None => MaybeTls::Plain { io: stream },
        };

        let local = conn.local_addr().map(Address::from).unwrap_or(Address::Unnamed);
        self.inner.events.info(&local, &remote, ConnState::New);
        debug!("connected to {remote}");

        Ok((conn, local, remote))
    }

    /// Dial and keep the connection for later reads and writes. An
    /// existing connection is closed first.
    pub async fn connect(&self) -> Result<(), Error> {
        let (conn, ..) = self.dial().await?;

        let mut slot = self.inner.conn.lock().await;
        if let Some(mut old) = slot.replace(conn) {
            if let Err(e) = old.shutdown().await {
                self.report(e);
            }
        }
        Ok(())
    }

    /// Whether a persistent connection is currently held. Treats a
    /// contended lock as connected since a caller is using it.
    pub fn is_connected(&self) -> bool {
        match self.inner.conn.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    /// Write `payload` on the persistent connection.
    pub async fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let mut slot = self.inner.conn.lock().await;
        let conn = slot.as_mut().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Write);
        conn.write_all(payload).await?;
        conn.flush().await?;
        Ok(())
    }

    /// Read at most `buf.len()` bytes from the persistent connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut slot = self.inner.conn.lock().await;
        let conn = slot.as_mut().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Read);
        Ok(conn.read(buf).await?)
    }

    /// Close the persistent connection, if any.
    pub async fn close(&self) -> Result<(), Error> {
        let mut slot = self.inner.conn.lock().await;
        if let Some(mut conn) = slot.take() {
            self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Close);
            conn.shutdown().await?;
        }
        Ok(())
    }

    /// One-shot exchange on a fresh connection: write `request`,
    /// half-close, then hand the complete reply to `reader`.
    pub async fn once<F>(&self, request: &[u8], reader: F) -> Result<(), Error>
    where
        F: FnOnce(&[u8]),
    {
        let (conn, local, remote) = self.dial().await?;

        let reply = exchange(conn, request, &self.inner.events, &local, &remote).await?;
        reader(&reply);

        self.inner.events.info(&local, &remote, ConnState::Close);
        Ok(())
    }

    /// One-shot exchange returning the reply as owned bytes.
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes, Error> {
        let mut reply = Bytes::new();
        self.once(payload, |raw| reply = Bytes::copy_from_slice(raw)).await?;
        Ok(reply)
    }

    fn report(&self, e: std::io::Error) {
        if let Some(e) = error_filter(e) {
            self.inner.events.error(&Error::from(e));
        }
    }
}

fn store<T: Clone>(slot: &RwLock<Option<T>>, value: Option<T>) {
    if let Ok(mut slot) = slot.write() {
        *slot = value;
    }
}

fn load<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    match slot.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    }
}
