use core::{future::Future, pin::Pin};
use std::{io, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{Address, Callbacks, ConnState};

/// Boxed future returned by [`Handler::handle`], borrowing the request
/// it was built from.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Server-side callback processing one complete payload.
///
/// Stream servers invoke the handler once per delimiter-terminated line
/// read from the connection; datagram servers once per received packet.
/// The payload always ends with [`crate::EOL`]. The handler writes its
/// response through [`Request::respond`]; on datagram transports the
/// response stream is a discard sink.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: Request<'a>) -> BoxFuture<'a, io::Result<()>>;
}

/// One request handed to a [`Handler`]: the payload, the peer addresses
/// and the response stream of the underlying transport.
pub struct Request<'a> {
    payload: Bytes,
    local: Address,
    remote: Address,
    writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    events: Option<Arc<Callbacks>>,
}

impl<'a> Request<'a> {
    pub fn new(
        payload: Bytes,
        local: Address,
        remote: Address,
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> Self {
        Self {
            payload,
            local,
            remote,
            writer,
            events: None,
        }
    }

    /// Attach the callback registry so responses report
    /// [`ConnState::Write`] transitions.
    pub fn with_events(mut self, events: Arc<Callbacks>) -> Self {
        self.events = Some(events);
        self
    }

    /// Complete request payload, delimiter included.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote
    }

    /// Write a response to the peer.
    pub async fn respond(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Some(events) = &self.events {
            events.info(&self.local, &self.remote, ConnState::Write);
        }
        self.writer.write_all(buf).await?;
        self.writer.flush().await
    }
}

/// [`Handler`] built from a plain function, the usual way to register
/// one:
///
/// ```
/// use sockline_core::{BoxFuture, Request, fn_handler};
///
/// fn echo<'a>(mut req: Request<'a>) -> BoxFuture<'a, std::io::Result<()>> {
///     Box::pin(async move {
///         let payload = req.payload().clone();
///         req.respond(&payload).await
///     })
/// }
///
/// let handler = fn_handler(echo);
/// # let _ = handler;
/// ```
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(Request<'a>) -> BoxFuture<'a, io::Result<()>> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
        (self.0)(req)
    }
}

/// Wrap a function as a shared [`Handler`].
pub fn fn_handler<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(Request<'a>) -> BoxFuture<'a, io::Result<()>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod test {
    use super::*;

    fn echo<'a>(mut req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let payload = req.payload().clone();
            req.respond(&payload).await
        })
    }

    #[tokio::test]
    async fn fn_handler_echoes() {
        let handler = fn_handler(echo);

        let mut out = Vec::new();
        let req = Request::new(
            Bytes::from_static(b"hi\n"),
            Address::Unnamed,
            Address::Unnamed,
            &mut out,
        );

        handler.handle(req).await.unwrap();
        assert_eq!(out, b"hi\n");
    }

    #[tokio::test]
    async fn respond_reports_write_state() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let writes = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Callbacks::new());
        let w = writes.clone();
        events.register_info(Some(Arc::new(move |_, _, state| {
            if state == ConnState::Write {
                w.fetch_add(1, Ordering::SeqCst);
            }
        })));

        let mut out = Vec::new();
        let mut req = Request::new(
            Bytes::from_static(b"ping\n"),
            Address::Unnamed,
            Address::Unnamed,
            &mut out,
        )
        .with_events(events);

        req.respond(b"pong\n").await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(out, b"pong\n");
    }
}
