#![cfg(unix)]

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tokio_util::sync::CancellationToken;

use sockline_core::{BoxFuture, Handler, Request};
use sockline_server::UnixServer;

struct Echo;

impl Handler for Echo {
    fn handle<'a>(&'a self, mut req: Request<'a>) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let payload = req.payload().clone();
            req.respond(&payload).await
        })
    }
}

#[tokio::test]
async fn echoes_and_removes_socket_file() {
    let path = std::env::temp_dir().join(format!("sockline-test-{}.sock", std::process::id()));
    let path_str = path.to_str().unwrap().to_owned();

    let srv = UnixServer::new();
    srv.register_socket(&path_str, Some(0o660), None).unwrap();
    srv.register_handler(Arc::new(Echo));

    let task = {
        let srv = srv.clone();
        tokio::spawn(async move { srv.listen(CancellationToken::new()).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !srv.is_running() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(path.exists());

    let mut conn = UnixStream::connect(&path).await.unwrap();
    conn.write_all(b"hello\n").await.unwrap();

    let mut reply = vec![0u8; 6];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello\n");

    drop(conn);
    srv.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    // socket file must be cleaned up with the listener.
    assert!(!path.exists());
}
