use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;

use sockline_core::{Address, Callbacks, ConnState};

pin_project! {
    /// A client connection that is either plaintext or wrapped in TLS,
    /// behind one read/write surface.
    #[project = MaybeTlsProj]
    pub(crate) enum MaybeTls {
        Plain { #[pin] io: TcpStream },
        Tls { #[pin] io: TlsStream<TcpStream> },
    }
}

impl MaybeTls {
    pub(crate) fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            Self::Plain { io } => io.local_addr(),
            Self::Tls { io } => io.get_ref().0.local_addr(),
        }
    }
}

impl AsyncRead for MaybeTls {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { io } => io.poll_read(cx, buf),
            MaybeTlsProj::Tls { io } => io.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsProj::Plain { io } => io.poll_write(cx, buf),
            MaybeTlsProj::Tls { io } => io.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { io } => io.poll_flush(cx),
            MaybeTlsProj::Tls { io } => io.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { io } => io.poll_shutdown(cx),
            MaybeTlsProj::Tls { io } => io.poll_shutdown(cx),
        }
    }
}

/// One-shot exchange over a freshly dialed stream: write the request,
/// half-close the write side, then read the reply until the server
/// closes. Each phase is reported through the event registry.
pub(crate) async fn exchange<S>(
    mut io: S,
    request: &[u8],
    events: &Callbacks,
    local: &Address,
    remote: &Address,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    events.info(local, remote, ConnState::Write);
    io.write_all(request).await?;
    io.flush().await?;

    events.info(local, remote, ConnState::CloseWrite);
    io.shutdown().await?;

    events.info(local, remote, ConnState::Read);
    let mut reply = Vec::new();
    io.read_to_end(&mut reply).await?;

    events.info(local, remote, ConnState::CloseRead);
    Ok(reply)
}
