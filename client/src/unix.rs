use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use sockline_core::{Address, Callbacks, ConnState, Error, FuncError, FuncInfo, error_filter};

use crate::stream::exchange;

/// Unix domain stream client. Same surface as [`crate::TcpClient`]
/// without the TLS layer.
#[derive(Clone)]
pub struct UnixClient {
    inner: Arc<Inner>,
}

struct Inner {
    path: RwLock<Option<PathBuf>>,
    events: Arc<Callbacks>,
    conn: tokio::sync::Mutex<Option<UnixStream>>,
}

impl Default for UnixClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                path: RwLock::new(None),
                events: Arc::new(Callbacks::new()),
                conn: tokio::sync::Mutex::new(None),
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

    async fn dial(&self) -> Result<(UnixStream, Address, Address), Error> {
        let path = self.path()?;
        let remote = Address::Path(path.clone());

        self.inner.events.info(&Address::Unnamed, &remote, ConnState::Dial);
        let stream = UnixStream::connect(&path).await?;
        self.inner.events.info(&Address::Unnamed, &remote, ConnState::New);

        Ok((stream, Address::Unnamed, remote))
    }

    pub async fn connect(&self) -> Result<(), Error> {
        let (conn, ..) = self.dial().await?;

        let mut slot = self.inner.conn.lock().await;
        if let Some(mut old) = slot.replace(conn) {
            if let Err(e) = old.shutdown().await {
                if let Some(e) = error_filter(e) {
                    self.inner.events.error(&Error::from(e));
                }
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        match self.inner.conn.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    pub async fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let mut slot = self.inner.conn.lock().await;
        let conn = slot.as_mut().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Write);
        conn.write_all(payload).await?;
        conn.flush().await?;
        Ok(())
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut slot = self.inner.conn.lock().await;
        let conn = slot.as_mut().ok_or(Error::ServerClosed)?;

        self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Read);
        Ok(conn.read(buf).await?)
    }

    pub async fn close(&self) -> Result<(), Error> {
        let mut slot = self.inner.conn.lock().await;
        if let Some(mut conn) = slot.take() {
            self.inner.events.info(&Address::Unnamed, &Address::Unnamed, ConnState::Close);
            conn.shutdown().await?;
        }
        Ok(())
    }

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
        let client = UnixClient::new();
        assert!(matches!(client.register_socket(""), Err(Error::InvalidAddress)));
    }
}
