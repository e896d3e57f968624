use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{net::UnixDatagram, time::sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info};

use sockline_core::{
    Address, Callbacks, ConnState, DEFAULT_BUFFER_SIZE, EOL, Error, FuncError, FuncInfo,
    FuncInfoServer, Handler, Request, TlsContext, error_filter,
};

use crate::{
    config::MAX_GID,
    shutdown::{SHUTDOWN_CAP, wait_until},
};

/// Hook run against the bound socket before the receive loop starts.
pub type UpdateUnixgramConn = Arc<dyn Fn(&UnixDatagram) + Send + Sync>;

struct Inner {
    path: RwLock<Option<PathBuf>>,
    perm: RwLock<Option<u32>>,
    group: RwLock<Option<u32>>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    update: RwLock<Option<UpdateUnixgramConn>>,
    events: Arc<Callbacks>,
    running: AtomicBool,
    gone: AtomicBool,
    stop: CancellationToken,
    buffer_size: usize,
}

/// Connectionless unix domain datagram server. Same per-datagram
/// semantics as [`crate::UdpServer`], bound to a filesystem path with
/// the same socket-file lifecycle as [`crate::UnixServer`].
#[derive(Clone)]
pub struct UnixgramServer {
    inner: Arc<Inner>,
}

impl Default for UnixgramServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixgramServer {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_options(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: RwLock::new(None),
                perm: RwLock::new(None),
                group: RwLock::new(None),
                handler: RwLock::new(None),
                update: RwLock::new(None),
                events: Arc::new(Callbacks::new()),
                running: AtomicBool::new(false),
                gone: AtomicBool::new(false),
                stop: CancellationToken::new(),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn register_socket(&self, path: &str, perm: Option<u32>, group: Option<u32>) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::InvalidAddress);
        }
        if let Some(gid) = group {
            if gid > MAX_GID {
                return Err(Error::InvalidGroup);
            }
        }

        store(&self.inner.path, Some(PathBuf::from(path)));
        store(&self.inner.perm, perm);
        store(&self.inner.group, group);
        Ok(())
    }

    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        store(&self.inner.handler, Some(handler));
    }

    pub fn register_update_conn(&self, f: Option<UpdateUnixgramConn>) {
        store(&self.inner.update, f);
    }

    pub fn register_func_error(&self, f: Option<FuncError>) {
        self.inner.events.register_error(f);
    }

    pub fn register_func_info(&self, f: Option<FuncInfo>) {
        self.inner.events.register_info(f);
    }

    pub fn register_func_info_server(&self, f: Option<FuncInfoServer>) {
        self.inner.events.register_info_server(f);
    }

    pub fn set_tls(&self, _enable: bool, _ctx: Option<&TlsContext>) -> Result<(), Error> {
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_gone(&self) -> bool {
        self.inner.gone.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> i64 {
        if self.is_running() { 1 } else { 0 }
    }

    pub fn local_addr(&self) -> Option<Address> {
        load(&self.inner.path).map(Address::Path)
    }

    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.stop.clone().cancelled_owned()
    }

    fn bind(&self, path: &Path) -> Result<UnixDatagram, Error> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e)),
        }

        let socket = UnixDatagram::bind(path)?;

        if let Some(mode) = load(&self.inner.perm) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        if let Some(gid) = load(&self.inner.group) {
            std::os::unix::fs::chown(path, None, Some(gid))?;
        }

        Ok(socket)
    }

    /// Bind the socket file and receive datagrams until stopped.
    pub async fn listen(&self, token: CancellationToken) -> Result<(), Error> {
        let handler = load(&self.inner.handler).ok_or(Error::InvalidHandler)?;
        let path = load(&self.inner.path).ok_or(Error::InvalidAddress)?;

        if token.is_cancelled() {
            return Err(Error::ContextClosed);
        }
        if self.inner.stop.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        let socket = self.bind(&path)?;
        let local = Address::Path(path.clone());

        if let Some(update) = load(&self.inner.update) {
            update(&socket);
        }

        self.inner.running.store(true, Ordering::SeqCst);
        info!("unixgram server listening on {local}");
        self.inner.events.info_server(&format!("listening on {local}"));

        let watcher = {
            let srv = self.clone();
            let token = token.clone();
            let stop = self.inner.stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = srv.shutdown().await;
                    }
                    _ = stop.cancelled() => {}
                }
            })
        };

        let mut buf = vec![0u8; self.inner.buffer_size];

        loop {
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        if self.is_gone() {
                            continue;
                        }

                        let remote = Address::from(&peer);
                        self.dispatch(&handler, &buf[..n], &local, &remote).await;
                    }
                    Err(e) => {
                        if let Some(e) = error_filter(e) {
                            error!("error receiving datagram: {e}");
                            self.inner.events.error(&Error::from(e));
                        }
                        sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        drop(socket);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                self.inner.events.error(&Error::from(e));
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        info!("unixgram server on {local} stopped");
        self.inner.events.info_server(&format!("stopped listening on {local}"));
        watcher.abort();

        Ok(())
    }

    async fn dispatch(&self, handler: &Arc<dyn Handler>, datagram: &[u8], local: &Address, remote: &Address) {
        let mut payload = BytesMut::with_capacity(datagram.len() + 1);
        payload.put_slice(datagram);
        if payload.last() != Some(&EOL) {
            payload.put_u8(EOL);
        }

        self.inner.events.info(local, remote, ConnState::Read);
        self.inner.events.info(local, remote, ConnState::Handler);

        let mut sink = tokio::io::sink();
        let req = Request::new(Bytes::from(payload), local.clone(), remote.clone(), &mut sink)
            .with_events(self.inner.events.clone());

        if let Err(e) = handler.handle(req).await {
            if let Some(e) = error_filter(e) {
                self.inner.events.error(&Error::from(e));
            }
        }
    }

    pub async fn stop_listen(&self) -> Result<(), Error> {
        self.inner.stop.cancel();
        wait_until(|| !self.is_running(), Error::ShutdownTimeout).await
    }

    pub async fn stop_gone(&self) -> Result<(), Error> {
        self.inner.gone.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        if !self.is_running() && (self.inner.stop.is_cancelled() || !self.is_gone()) {
            return Ok(());
        }

        match tokio::time::timeout(SHUTDOWN_CAP, async {
            self.stop_gone().await?;
            self.stop_listen().await
        })
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::ShutdownTimeout),
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.shutdown().await
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_empty_path_is_invalid() {
        let srv = UnixgramServer::new();
        assert!(matches!(srv.register_socket("", None, None), Err(Error::InvalidAddress)));
    }

    #[test]
    fn register_group_over_limit_is_invalid() {
        let srv = UnixgramServer::new();
        let res = srv.register_socket("/tmp/sockline-gram.sock", None, Some(MAX_GID + 1));
        assert!(matches!(res, Err(Error::InvalidGroup)));
    }
}
