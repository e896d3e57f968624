use std::time::Duration;

use tokio::net::UdpSocket;

use sockline_client::UdpClient;

async fn start_udp_echo() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });

    addr
}

#[tokio::test]
async fn once_with_timeout_receives_reply() {
    let addr = start_udp_echo().await;

    let client = UdpClient::with_options(2048, Some(Duration::from_secs(2)));
    client.register_server(&addr.to_string()).unwrap();

    let reply = client.request(b"ping\n").await.unwrap();
    assert_eq!(&reply[..], b"ping\n");
}

#[tokio::test]
async fn once_without_timeout_skips_reply_phase() {
    let addr = start_udp_echo().await;

    let client = UdpClient::new();
    client.register_server(&addr.to_string()).unwrap();

    let mut seen = None;
    client.once(b"fire and forget\n", |raw| seen = Some(raw.to_vec())).await.unwrap();
    assert_eq!(seen.as_deref(), Some(&b""[..]));
}

#[tokio::test]
async fn persistent_socket_roundtrip() {
    let addr = start_udp_echo().await;

    let client = UdpClient::new();
    client.register_server(&addr.to_string()).unwrap();
    client.connect().await.unwrap();
    assert!(client.is_connected());

    client.write(b"datagram\n").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"datagram\n");

    client.close().await.unwrap();
    assert!(!client.is_connected());
}

#[cfg(unix)]
mod unixgram {
    use std::{
        io,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use sockline_client::UnixgramClient;
    use sockline_core::{BoxFuture, Handler, Request};
    use sockline_server::UnixgramServer;

    struct Recorder(Arc<Mutex<Vec<Bytes>>>);

    impl Handler for Recorder {
        fn handle<'a>(&'a self, req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(req.payload().clone());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn once_delivers_datagram_to_server() {
        let path = std::env::temp_dir().join(format!("sockline-gram-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap().to_owned();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let srv = UnixgramServer::new();
        srv.register_socket(&path_str, None, None).unwrap();
        srv.register_handler(Arc::new(Recorder(seen.clone())));

        let task = {
            let srv = srv.clone();
            tokio::spawn(async move { srv.listen(CancellationToken::new()).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !srv.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = UnixgramClient::new();
        client.register_socket(&path_str).unwrap();

        // the local socket is unnamed, so no reply phase is expected.
        client.once(b"over the wall", |raw| assert!(raw.is_empty())).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().unwrap().as_slice(), [Bytes::from_static(b"over the wall\n")]);

        srv.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
