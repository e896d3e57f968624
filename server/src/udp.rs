use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Socket, Type};
use tokio::{net::UdpSocket, time::sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info};

use sockline_core::{
    Address, Callbacks, ConnState, DEFAULT_BUFFER_SIZE, EOL, Error, FuncError, FuncInfo,
    FuncInfoServer, Handler, Request, TlsContext, error_filter,
};

use crate::shutdown::{SHUTDOWN_CAP, wait_until};

/// Hook run against the bound socket before the receive loop starts.
pub type UpdateUdpConn = Arc<dyn Fn(&UdpSocket) + Send + Sync>;

struct Inner {
    address: RwLock<Option<SocketAddr>>,
    bound: RwLock<Option<Address>>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    update: RwLock<Option<UpdateUdpConn>>,
    events: Arc<Callbacks>,
    running: AtomicBool,
    gone: AtomicBool,
    stop: CancellationToken,
    buffer_size: usize,
}

/// Connectionless Udp server.
///
/// Each received datagram is one payload: the delimiter is appended
/// when missing and the handler runs inline in the receive loop, in
/// arrival order. There is no per-connection state; a running server
/// counts as one open connection.
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<Inner>,
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpServer {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_options(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: RwLock::new(None),
                bound: RwLock::new(None),
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

    pub fn register_server(&self, address: &str) -> Result<(), Error> {
        if address.is_empty() {
            return Err(Error::InvalidAddress);
        }

        let resolved = address
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;

        store(&self.inner.address, Some(resolved));
        Ok(())
    }

    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        store(&self.inner.handler, Some(handler));
    }

    pub fn register_update_conn(&self, f: Option<UpdateUdpConn>) {
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

    /// Datagram transports carry no TLS; accepted as a no-op so the
    /// protocols stay interchangeable behind [`crate::Server`].
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
        load(&self.inner.bound)
    }

    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.stop.clone().cancelled_owned()
    }

    fn bind(&self, addr: SocketAddr) -> Result<UdpSocket, Error> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(self.inner.buffer_size)?;
        socket.bind(&addr.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Bind the socket and receive datagrams until stopped.
    pub async fn listen(&self, token: CancellationToken) -> Result<(), Error> {
        let handler = load(&self.inner.handler).ok_or(Error::InvalidHandler)?;
        let address = load(&self.inner.address).ok_or(Error::InvalidAddress)?;

        if token.is_cancelled() {
            return Err(Error::ContextClosed);
        }
        if self.inner.stop.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        let socket = self.bind(address)?;
        let local = Address::from(socket.local_addr()?);
        store(&self.inner.bound, Some(local.clone()));

        if let Some(update) = load(&self.inner.update) {
            update(&socket);
        }

        self.inner.running.store(true, Ordering::SeqCst);
        info!("udp server listening on {local}");
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

                        let remote = Address::from(peer);
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
        self.inner.running.store(false, Ordering::SeqCst);
        info!("udp server on {local} stopped");
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

        // Udp carries no reply channel: handler writes go nowhere.
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

    /// Datagram servers have no live connections to drain; this only
    /// flips the gone flag so further datagrams are dropped.
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
    fn register_empty_address_is_invalid() {
        let srv = UdpServer::new();
        assert!(matches!(srv.register_server(""), Err(Error::InvalidAddress)));
    }

    #[tokio::test]
    async fn listen_without_handler_fails() {
        let srv = UdpServer::new();
        srv.register_server("127.0.0.1:0").unwrap();

        let res = srv.listen(CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::InvalidHandler)));
    }

    #[tokio::test]
    async fn cancelled_token_is_rejected() {
        let srv = UdpServer::new();
        srv.register_server("127.0.0.1:0").unwrap();
        srv.register_handler(Arc::new(Nop));

        let token = CancellationToken::new();
        token.cancel();

        let res = srv.listen(token).await;
        assert!(matches!(res, Err(Error::ContextClosed)));
    }

    struct Nop;

    impl Handler for Nop {
        fn handle<'a>(&'a self, _: Request<'a>) -> sockline_core::BoxFuture<'a, std::io::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }
}
