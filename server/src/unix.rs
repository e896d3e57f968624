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

use tokio::{
    net::{UnixListener, UnixStream},
    time::sleep,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info};

use sockline_core::{
    Address, Callbacks, ConnState, Counter, DEFAULT_BUFFER_SIZE, Error, FuncError, FuncInfo,
    FuncInfoServer, Handler, TlsContext, error_filter,
};

use crate::{
    config::MAX_GID,
    shutdown::{SHUTDOWN_CAP, wait_until},
    stream::{ConnParams, connection_error, drive},
};

/// Hook run against every accepted connection before it is handled.
pub type UpdateUnixConn = Arc<dyn Fn(&UnixStream) + Send + Sync>;

struct Inner {
    path: RwLock<Option<PathBuf>>,
    perm: RwLock<Option<u32>>,
    group: RwLock<Option<u32>>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    update: RwLock<Option<UpdateUnixConn>>,
    events: Arc<Callbacks>,
    running: AtomicBool,
    gone: AtomicBool,
    stop: CancellationToken,
    drain: CancellationToken,
    conns: Counter,
    buffer_size: usize,
    idle: Option<Duration>,
}

/// Connection-oriented unix domain server. Same lifecycle and framing
/// as [`crate::TcpServer`], bound to a filesystem path instead of an
/// inet address. The socket file is created on listen and removed when
/// the listener exits.
#[derive(Clone)]
pub struct UnixServer {
    inner: Arc<Inner>,
}

impl Default for UnixServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixServer {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BUFFER_SIZE, None)
    }

    pub fn with_options(buffer_size: usize, idle: Option<Duration>) -> Self {
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
                drain: CancellationToken::new(),
                conns: Counter::new(),
                buffer_size: buffer_size.max(1),
                idle: idle.filter(|d| *d >= Duration::from_secs(1)),
            }),
        }
    }

    /// Store the socket path with optional file mode and owning group.
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

    pub fn register_update_conn(&self, f: Option<UpdateUnixConn>) {
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

    /// TLS over unix domain sockets is not supported; accepted as a
    /// no-op so the protocols stay interchangeable.
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
        self.inner.conns.get()
    }

    pub fn local_addr(&self) -> Option<Address> {
        load(&self.inner.path).map(Address::Path)
    }

    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.stop.clone().cancelled_owned()
    }

    /// Future resolving once draining has started. Like the stop
    /// signal, the gone signal closes exactly once.
    pub fn gone(&self) -> WaitForCancellationFutureOwned {
        self.inner.drain.clone().cancelled_owned()
    }

    fn bind(&self, path: &Path) -> Result<UnixListener, Error> {
        // a previous run may have left the socket file behind.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e)),
        }

        let listener = UnixListener::bind(path)?;

        if let Some(mode) = load(&self.inner.perm) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        if let Some(gid) = load(&self.inner.group) {
            std::os::unix::fs::chown(path, None, Some(gid))?;
        }

        Ok(listener)
    }

    /// Bind the socket file and accept until stopped.
    pub async fn listen(&self, token: CancellationToken) -> Result<(), Error> {
        let handler = load(&self.inner.handler).ok_or(Error::InvalidHandler)?;
        let path = load(&self.inner.path).ok_or(Error::InvalidAddress)?;

        if token.is_cancelled() {
            return Err(Error::ContextClosed);
        }
        if self.inner.stop.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        let listener = self.bind(&path)?;
        let local = Address::Path(path.clone());

        self.inner.running.store(true, Ordering::SeqCst);
        info!("unix server listening on {local}");
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

        loop {
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.is_gone() {
                            drop(stream);
                            continue;
                        }
                        self.spawn_connection(handler.clone(), stream, Address::from(&peer), &local);
                    }
                    Err(ref e) if connection_error(e) => continue,
                    Err(e) => {
                        if let Some(e) = error_filter(e) {
                            error!("error accepting connection: {e}");
                            self.inner.events.error(&Error::from(e));
                        }
                        sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                self.inner.events.error(&Error::from(e));
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        info!("unix server on {local} stopped");
        self.inner.events.info_server(&format!("stopped listening on {local}"));
        watcher.abort();

        Ok(())
    }

    fn spawn_connection(&self, handler: Arc<dyn Handler>, stream: UnixStream, remote: Address, local: &Address) {
        if let Some(update) = load(&self.inner.update) {
            update(&stream);
        }

        let guard = self.inner.conns.guard();
        let events = self.inner.events.clone();
        events.info(local, &remote, ConnState::New);

        let params = ConnParams {
            handler,
            events,
            local: local.clone(),
            remote,
            buffer_size: self.inner.buffer_size,
            idle: self.inner.idle,
        };

        tokio::spawn(async move {
            drive(stream, params).await;
            drop(guard);
        });
    }

    pub async fn stop_listen(&self) -> Result<(), Error> {
        self.inner.stop.cancel();
        wait_until(|| !self.is_running(), Error::ShutdownTimeout).await
    }

    pub async fn stop_gone(&self) -> Result<(), Error> {
        self.inner.gone.store(true, Ordering::SeqCst);
        self.inner.drain.cancel();
        wait_until(|| self.open_connections() == 0, Error::GoneTimeout).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        if !self.is_running() && self.open_connections() == 0 {
            if self.inner.stop.is_cancelled() || !self.is_gone() {
                return Ok(());
            }
        }

        match tokio::time::timeout(SHUTDOWN_CAP, async {
            let drained = self.stop_gone().await;
            let stopped = self.stop_listen().await;
            drained.and(stopped)
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
        let srv = UnixServer::new();
        assert!(matches!(srv.register_socket("", None, None), Err(Error::InvalidAddress)));
    }

    #[test]
    fn register_group_over_limit_is_invalid() {
        let srv = UnixServer::new();
        let res = srv.register_socket("/tmp/sockline-test.sock", None, Some(MAX_GID + 1));
        assert!(matches!(res, Err(Error::InvalidGroup)));
    }

    #[tokio::test]
    async fn gone_resolves_when_draining_starts() {
        let srv = UnixServer::new();
        let gone = srv.gone();

        srv.stop_gone().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), gone).await.unwrap();
        assert!(srv.is_gone());

        // closing the gone signal again is a no-op.
        srv.stop_gone().await.unwrap();
    }

    #[test]
    fn local_addr_reflects_path() {
        let srv = UnixServer::new();
        srv.register_socket("/tmp/sockline-test.sock", Some(0o660), None).unwrap();
        assert_eq!(
            srv.local_addr().map(|a| a.to_string()),
            Some("/tmp/sockline-test.sock".to_owned())
        );
    }
}
