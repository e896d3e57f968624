use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use sockline_core::{Address, Callbacks, ConnState, EOL, Error, Handler, Request, error_filter};

/// Everything a spawned connection task needs, cloned out of the server
/// before the transport is moved into the task.
pub(crate) struct ConnParams {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) events: Arc<Callbacks>,
    pub(crate) local: Address,
    pub(crate) remote: Address,
    pub(crate) buffer_size: usize,
    pub(crate) idle: Option<Duration>,
}

/// Drive one accepted stream connection to completion.
///
/// Reads delimiter-terminated payloads through a buffered reader and
/// invokes the handler once per payload. The final unterminated chunk
/// before EOF gets the delimiter appended. The loop ends on EOF
/// (`CloseRead`), handler failure, idle timeout or transport error;
/// the write side is then half-closed (`CloseWrite`) before the
/// connection is destroyed (`Close`).
pub(crate) async fn drive<S>(io: S, p: ConnParams)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (rd, mut wr) = tokio::io::split(io);
    let mut rd = BufReader::with_capacity(p.buffer_size, rd);
    let mut buf = Vec::with_capacity(p.buffer_size);

    loop {
        buf.clear();

        match read_payload(&mut rd, &mut buf, p.idle).await {
            Ok(0) => {
                p.events.info(&p.local, &p.remote, ConnState::CloseRead);
                break;
            }
            Ok(_) => {
                if buf.last() != Some(&EOL) {
                    buf.push(EOL);
                }

                p.events.info(&p.local, &p.remote, ConnState::Read);
                p.events.info(&p.local, &p.remote, ConnState::Handler);

                let req = Request::new(
                    Bytes::copy_from_slice(&buf),
                    p.local.clone(),
                    p.remote.clone(),
                    &mut wr,
                )
                .with_events(p.events.clone());

                if let Err(e) = p.handler.handle(req).await {
                    report(&p.events, e);
                    break;
                }
            }
            Err(e) => {
                report(&p.events, e);
                break;
            }
        }
    }

    p.events.info(&p.local, &p.remote, ConnState::CloseWrite);
    if let Err(e) = wr.shutdown().await {
        report(&p.events, e);
    }

    p.events.info(&p.local, &p.remote, ConnState::Close);
}

async fn read_payload<R>(rd: &mut R, buf: &mut Vec<u8>, idle: Option<Duration>) -> io::Result<usize>
where
    R: AsyncBufReadExt + Unpin,
{
    match idle {
        Some(idle) => match tokio::time::timeout(idle, rd.read_until(EOL, buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        },
        None => rd.read_until(EOL, buf).await,
    }
}

fn report(events: &Callbacks, e: io::Error) {
    if let Some(e) = error_filter(e) {
        events.error(&Error::from(e));
    }
}

/// Accept errors scoped to one connection: the next accept may well
/// succeed, so the loop continues without backoff.
pub(crate) fn connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use sockline_core::BoxFuture;

    use super::*;

    struct Recorder(Arc<Mutex<Vec<Bytes>>>);

    impl Handler for Recorder {
        fn handle<'a>(&'a self, req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(req.payload().clone());
                Ok(())
            })
        }
    }

    struct Echo;

    impl Handler for Echo {
        fn handle<'a>(&'a self, mut req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                let payload = req.payload().clone();
                req.respond(&payload).await
            })
        }
    }

    fn params(handler: Arc<dyn Handler>) -> ConnParams {
        ConnParams {
            handler,
            events: Arc::new(Callbacks::new()),
            local: Address::Unnamed,
            remote: Address::Unnamed,
            buffer_size: 1024,
            idle: None,
        }
    }

    #[tokio::test]
    async fn splits_payloads_on_delimiter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(drive(server, params(Arc::new(Recorder(seen.clone())))));

        let (_, mut wr) = tokio::io::split(client);
        wr.write_all(b"one\ntwo\n").await.unwrap();
        wr.shutdown().await.unwrap();

        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), [Bytes::from_static(b"one\n"), Bytes::from_static(b"two\n")]);
    }

    #[tokio::test]
    async fn appends_missing_delimiter_before_eof() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(drive(server, params(Arc::new(Recorder(seen.clone())))));

        let (_, mut wr) = tokio::io::split(client);
        wr.write_all(b"tail without newline").await.unwrap();
        wr.shutdown().await.unwrap();

        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), [Bytes::from_static(b"tail without newline\n")]);
    }

    #[tokio::test]
    async fn echoes_responses_back() {
        let (client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(drive(server, params(Arc::new(Echo))));

        let (rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"hi\n").await.unwrap();

        let mut lines = BufReader::new(rd);
        let mut line = Vec::new();
        lines.read_until(EOL, &mut line).await.unwrap();
        assert_eq!(line, b"hi\n");

        wr.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn event_order_per_connection() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Callbacks::new());
        let s = states.clone();
        events.register_info(Some(Arc::new(move |_, _, state| {
            s.lock().unwrap().push(state);
        })));

        let (client, server) = tokio::io::duplex(1024);
        let mut p = params(Arc::new(Echo));
        p.events = events;
        let task = tokio::spawn(drive(server, p));

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"hi\n").await.unwrap();
        wr.shutdown().await.unwrap();

        let mut sink = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rd, &mut sink).await.unwrap();
        task.await.unwrap();

        let states = states.lock().unwrap();
        assert_eq!(
            states.as_slice(),
            [
                ConnState::Read,
                ConnState::Handler,
                ConnState::Write,
                ConnState::CloseRead,
                ConnState::CloseWrite,
                ConnState::Close,
            ]
        );
    }
}
