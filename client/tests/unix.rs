#![cfg(unix)]

use std::{io, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use sockline_client::UnixClient;
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
async fn one_shot_echo_over_unix_socket() {
    let path = std::env::temp_dir().join(format!("sockline-cli-{}.sock", std::process::id()));
    let path_str = path.to_str().unwrap().to_owned();

    let srv = UnixServer::new();
    srv.register_socket(&path_str, None, None).unwrap();
    srv.register_handler(Arc::new(Echo));

    let task = {
        let srv = srv.clone();
        tokio::spawn(async move { srv.listen(CancellationToken::new()).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !srv.is_running() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let client = UnixClient::new();
    client.register_socket(&path_str).unwrap();

    let reply = client.request(b"unix hello\n").await.unwrap();
    assert_eq!(&reply[..], b"unix hello\n");

    srv.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}
