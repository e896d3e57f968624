use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::Bytes;
use tokio::net::UnixDatagram;

use sockline_core::{Address, Callbacks, ConnState, Error, FuncError, FuncInfo};

/// Unix domain datagram client, mirroring [`crate::UdpClient`] over a
/// filesystem path.
///
/// The local socket stays unnamed, so replies can only be received on
/// platforms with datagram autobind; as with Udp the reply phase runs
/// only when a receive timeout is configured.
#[derive(Clone)]
pub struct UnixgramClient {
    inner: Arc<Inner>,
}

struct Inner {
    path: RwLock<Option<PathBuf>>,
    events: Arc<Callbacks>,
    socket: tokio::sync::Mutex<Option<UnixDatagram>>,
    timeout: Option<Duration>,
    buffer_size: usize,
}

impl Default for UnixgramClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixgramClient {
    pub fn new() -> Self {
        Self::with_options(sockline_core::DEFAULT_BUFFER_SIZE, None)
    }

    pub fn with_options(buffer_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: RwLock::new(None),
                events: Arc::new(Callbacks::new()),
                socket: tokio::sync::Mutex::new(None),
                timeout,
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn register_socket(&self, path: &str) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::InvalidAddress);
        }

        if let Ok(mut slot) = self.inner.path.write() {
            *slot = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        self.inner.events.register_error(f);
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        self.inner.events.register_info(f);
    }

    fn path(&self) -> Result<PathBuf, Error> {
        match self.inner.path.read() {
            Ok(slot) => slot.clone().ok_or(Error::InvalidAddress),
            Err(_) => Err(Error::InvalidAddress),
        }
    }

    async fn dial(&self) -> Result<(UnixDatagram, Address, Address), Error> {
        let path = self.path()?;
        let remote = Address::Path(path.clone());

        self.inner.events.info(&Address::Unnamed, &remote, ConnState::Dial);
        let socket = UnixDatagram::unbound()?;
        socket.connect(&path)?;
        self.inner.events.info(&Address::Unnamed, &remote, ConnState::New);

        Ok((socket, Address::Unnamed, remote))
    }

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
    fn register_empty_path_is_invalid() {
        let client = UnixgramClient::new();
        assert!(matches!(client.register_socket(""), Err(Error::InvalidAddress)));
    }
}
