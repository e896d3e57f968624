use std::{
    net::ToSocketAddrs,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info};

use sockline_core::{
    Address, Callbacks, ConnState, Counter, DEFAULT_BUFFER_SIZE, Error, FuncError, FuncInfo,
    FuncInfoServer, Handler, TlsContext, error_filter,
};

use crate::{
    shutdown::{SHUTDOWN_CAP, wait_until},
    stream::{ConnParams, connection_error, drive},
};

/// Hook run against every accepted connection before it is handled,
/// e.g. to set `TCP_NODELAY` or keepalive options.
pub type UpdateTcpConn = Arc<dyn Fn(&TcpStream) + Send + Sync>;

struct Inner {
    address: RwLock<Option<String>>,
    bound: RwLock<Option<Address>>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    update: RwLock<Option<UpdateTcpConn>>,
    tls: RwLock<Option<Arc<rustls::ServerConfig>>>,
    events: Arc<Callbacks>,
    running: AtomicBool,
    gone: AtomicBool,
    stop: CancellationToken,
    drain: CancellationToken,
    conns: Counter,
    buffer_size: usize,
    idle: Option<Duration>,
}

/// Connection-oriented Tcp server.
///
/// Lifecycle: `Created → Configured → Running → Draining → Stopped`.
/// [`TcpServer::register_server`] configures the bind target,
/// [`TcpServer::listen`] runs the accept loop spawning one task per
/// connection, [`TcpServer::shutdown`] drains then stops. The stop
/// signal closes exactly once; a stopped server cannot listen again.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpServer {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BUFFER_SIZE, None)
    }

    /// Build with an explicit read buffer size and idle timeout. Idle
    /// timeouts below one second disable idle tracking.
    pub fn with_options(buffer_size: usize, idle: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: RwLock::new(None),
                bound: RwLock::new(None),
                handler: RwLock::new(None),
                update: RwLock::new(None),
                tls: RwLock::new(None),
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

    /// Validate and store the listen address. The address must resolve
    /// to at least one socket address.
    pub fn register_server(&self, address: &str) -> Result<(), Error> {
        if address.is_empty() {
            return Err(Error::InvalidAddress);
        }

        let resolved = address
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next();
        if resolved.is_none() {
            return Err(Error::InvalidAddress);
        }

        store(&self.inner.address, Some(address.to_owned()));
        Ok(())
    }

    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        store(&self.inner.handler, Some(handler));
    }

    pub fn register_update_conn(&self, f: Option<UpdateTcpConn>) {
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

    /// Install or clear TLS material.
    ///
    /// Disabling stores an empty slot and subsequent accepts serve
    /// plaintext. Enabling requires a context holding at least one
    /// certificate pair that resolves into a configuration pinned to
    /// TLS 1.2 through 1.3. The slot is read fresh on every accept, so
    /// changes apply to new connections without a listener restart.
    pub fn set_tls(&self, enable: bool, ctx: Option<&TlsContext>) -> Result<(), Error> {
        if !enable {
            store(&self.inner.tls, None);
            return Ok(());
        }

        let ctx = ctx.ok_or(Error::InvalidTlsConfig)?;
        if !ctx.has_certificates() {
            return Err(Error::InvalidTlsConfig);
        }

        let config = ctx.server_config()?;
        store(&self.inner.tls, Some(Arc::new(config)));
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

    /// Address actually bound, available once the server is running.
    pub fn local_addr(&self) -> Option<Address> {
        load(&self.inner.bound)
    }

    /// Future resolving once the stop signal has been closed. The
    /// signal closes exactly once over the server's lifetime no matter
    /// how many shutdown paths race to close it.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.stop.clone().cancelled_owned()
    }

    /// Future resolving once draining has started. Like the stop
    /// signal, the gone signal closes exactly once.
    pub fn gone(&self) -> WaitForCancellationFutureOwned {
        self.inner.drain.clone().cancelled_owned()
    }

    /// Bind the listener and accept until stopped.
    ///
    /// Fails with [`Error::InvalidHandler`] when no handler is
    /// registered, [`Error::InvalidAddress`] without a bind target,
    /// [`Error::ContextClosed`] when `token` is already cancelled and
    /// [`Error::ServerClosed`] when the server was stopped before.
    /// Cancelling `token` later triggers an asynchronous graceful
    /// shutdown.
    pub async fn listen(&self, token: CancellationToken) -> Result<(), Error> {
        let handler = load(&self.inner.handler).ok_or(Error::InvalidHandler)?;
        let address = load(&self.inner.address).ok_or(Error::InvalidAddress)?;

        if token.is_cancelled() {
            return Err(Error::ContextClosed);
        }
        if self.inner.stop.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        let listener = TcpListener::bind(address.as_str()).await?;
        let local = Address::from(listener.local_addr()?);
        store(&self.inner.bound, Some(local.clone()));

        self.inner.running.store(true, Ordering::SeqCst);
        info!("tcp server listening on {local}");
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
                            // draining: refuse by dropping right away.
                            drop(stream);
                            continue;
                        }
                        self.spawn_connection(handler.clone(), stream, Address::from(peer), &local);
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
        self.inner.running.store(false, Ordering::SeqCst);
        info!("tcp server on {local} stopped");
        self.inner.events.info_server(&format!("stopped listening on {local}"));
        watcher.abort();

        Ok(())
    }

    fn spawn_connection(&self, handler: Arc<dyn Handler>, stream: TcpStream, remote: Address, local: &Address) {
        if let Some(update) = load(&self.inner.update) {
            update(&stream);
        }

        let guard = self.inner.conns.guard();
        let events = self.inner.events.clone();
        events.info(local, &remote, ConnState::New);

        let tls = load(&self.inner.tls);
        let params = ConnParams {
            handler,
            events,
            local: local.clone(),
            remote,
            buffer_size: self.inner.buffer_size,
            idle: self.inner.idle,
        };

        tokio::spawn(async move {
            match tls {
                Some(config) => match TlsAcceptor::from(config).accept(stream).await {
                    Ok(stream) => drive(stream, params).await,
                    Err(e) => {
                        if let Some(e) = error_filter(e) {
                            params.events.error(&Error::from(e));
                        }
                        params.events.info(&params.local, &params.remote, ConnState::Close);
                    }
                },
                None => drive(stream, params).await,
            }
            drop(guard);
        });
    }

    /// Close the stop signal (idempotent) and wait for the accept loop
    /// to exit.
    pub async fn stop_listen(&self) -> Result<(), Error> {
        self.inner.stop.cancel();
        wait_until(|| !self.is_running(), Error::ShutdownTimeout).await
    }

    /// Mark the server gone, refuse new connections and wait for live
    /// ones to finish on their own. Existing connections are never
    /// force-closed here.
    pub async fn stop_gone(&self) -> Result<(), Error> {
        self.inner.gone.store(true, Ordering::SeqCst);
        self.inner.drain.cancel();
        wait_until(|| self.open_connections() == 0, Error::GoneTimeout).await
    }

    /// Graceful shutdown: drain first, then stop listening, under a 25
    /// second master cap. Returns the first error encountered.
    /// Idempotent; shutting down a server that never ran is a no-op.
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

    /// Alias for [`TcpServer::shutdown`].
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
    fn register_empty_address_is_invalid() {
        let srv = TcpServer::new();
        assert!(matches!(srv.register_server(""), Err(Error::InvalidAddress)));
        assert!(matches!(srv.register_server("not an address"), Err(Error::InvalidAddress)));
    }

    #[test]
    fn register_valid_address() {
        let srv = TcpServer::new();
        srv.register_server("127.0.0.1:0").unwrap();
        srv.register_server("localhost:0").unwrap();
    }

    #[test]
    fn set_tls_without_certificates_is_rejected() {
        let srv = TcpServer::new();
        let ctx = TlsContext::new();

        assert!(matches!(srv.set_tls(true, Some(&ctx)), Err(Error::InvalidTlsConfig)));
        assert!(matches!(srv.set_tls(true, None), Err(Error::InvalidTlsConfig)));

        // disabling never fails and clears the slot.
        srv.set_tls(false, None).unwrap();
        assert!(load(&srv.inner.tls).is_none());
    }

    #[tokio::test]
    async fn listen_without_handler_fails() {
        let srv = TcpServer::new();
        srv.register_server("127.0.0.1:0").unwrap();

        let res = srv.listen(CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::InvalidHandler)));
        assert!(!srv.is_running());
    }

    #[tokio::test]
    async fn idle_floor_disables_small_timeouts() {
        let srv = TcpServer::with_options(1024, Some(Duration::from_millis(200)));
        assert!(srv.inner.idle.is_none());

        let srv = TcpServer::with_options(1024, Some(Duration::from_secs(2)));
        assert_eq!(srv.inner.idle, Some(Duration::from_secs(2)));
    }
}
