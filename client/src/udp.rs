use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::RwLock,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio::net::UdpSocket;

use sockline_core::{Address, Callbacks, ConnState, Error, FuncError, FuncInfo};

/// Udp client.
///
/// Datagram transports have no stream to half-close, so a one-shot
/// exchange sends one datagram and, when a receive timeout is
/// configured, waits for at most one reply datagram. Without a timeout
/// the reply phase is skipped and the reader sees an empty slice.
#[derive(Clone)]
pub struct UdpClient {
    inner: Arc<Inner>,
}

struct Inner {
    address: RwLock<Option<SocketAddr>>,
    events: Arc<Callbacks>,
    socket: tokio::sync::Mutex<Option<UdpSocket>>,
    timeout: Option<Duration>,
    buffer_size: usize,
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpClient {
    pub fn new() -> Self {
        Self::with_options(sockline_core::DEFAULT_BUFFER_SIZE, None)
    }

    /// `timeout` bounds the reply wait of one-shot exchanges; `None`
    /// disables the reply phase entirely.
    pub fn with_options(buffer_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: RwLock::new(None),
                events: Arc::new(Callbacks::new()),
                socket: tokio::sync::Mutex::new(None),
                timeout,
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn register_server(&self, address: &str) -> Result<(), Error> {
        if address.is_empty() {
            return Err(Error::InvalidAddress);
        }

        let resolved = address
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;

        if let Ok(mut slot) = self.inner.address.write() {
            *slot = Some(resolved);
        }
        Ok(())
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        self.inner.events.register_error(f);
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        self.inner.events.register_info(f);
    }

    fn remote(&self) -> Result<SocketAddr, Error> {
        match self.inner.address.read() {
            Ok(slot) => slot.ok_or(Error::InvalidAddress),
            Err(_) => Err(Error::InvalidAddress),
        }
    }

    async fn dial(&self) -> Result<(UdpSocket, Address, Address), Error> {
        let remote = self.remote()?;
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let remote_addr = Address::from(remote);
        self.inner.events.info(&Address::Unnamed, &remote_addr, ConnState::Dial);

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;

        let local = socket.local_addr().map(Address::from).unwrap_or(Address::Unnamed);
        self.inner.events.info(&local, &remote_addr, ConnState::New);

        Ok((socket, local, remote_addr))
    }

    /// Bind a local socket and connect it to the server for later
    /// writes and reads.
    pub async fn connect(&self) -> Result<(), Error> {
        let (socket, ..) = self.dial().await?;
        *self.inner.socket.lock().await = Some(socket);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        match self.inner.socket.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    pub async fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let slot = self.inner.socket.lock().await;
        let socket = slot.as_ref().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Write);
        socket.send(payload).await?;
        Ok(())
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let slot = self.inner.socket.lock().await;
        let socket = slot.as_ref().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Read);
        Ok(socket.recv(buf).await?)
    }

    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.socket.lock().await.take().is_some() {
            self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Close);
        }
        Ok(())
    }

    /// One-shot exchange: send `request` as one datagram and hand the
    /// reply (or an empty slice without a configured timeout) to
    /// `reader`.
    pub async fn once<F>(&self, request: &[u8], reader: F) -> Result<(), Error>
    where
        F: FnOnce(&[u8]),
    {
        let (socket, local, remote) = self.dial().await?;

        self.inner.events.info(&local, &remote, ConnState::Write);
        socket.send(request).await?;

        match self.inner.timeout {
            Some(timeout) => {
                self.inner.events.info(&local, &remote, ConnState::Read);
                let mut buf = vec![0u8; self.inner.buffer_size];
                match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                    Ok(n) => reader(&buf[..n?]),
                    Err(_) => reader(&[]),
                }
            }
            None => reader(&[]),
        }

        self.inner.events.info(&local, &remote, ConnState::Close);
        Ok(())
    }

    pub async fn request(&self, payload: &[u8]) -> Result<Bytes, Error> {
        let mut reply = Bytes::new();
        self.once(payload, |raw| reply = Bytes::copy_from_slice(raw)).await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_empty_address_is_invalid() {
        let client = UdpClient::new();
        assert!(matches!(client.register_server(""), Err(Error::InvalidAddress)));
    }

    #[tokio::test]
    async fn write_without_connection_fails() {
        let client = UdpClient::new();
        assert!(matches!(client.write(b"hi\n").await, Err(Error::ServerClosed)));
    }
}
