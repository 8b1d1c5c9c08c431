//! Scripted server for reconnect tests
//!
//! Accepts any handshake. The first connection reads one request and hangs
//! up without answering; later connections answer every request with `OK`
//! and an empty list.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use yyspider_common::auth::{scan_handshake, HandshakeScan, HANDSHAKE_ACK};
use yyspider_common::{Message, MessageCodec, Response};

pub struct FlakyCoordinator {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl FlakyCoordinator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let nth = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, nth == 0));
            }
        });

        FlakyCoordinator { addr, connections }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(mut stream: TcpStream, hang_up: bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if let Ok(HandshakeScan::Complete { .. }) = scan_handshake(&buf) {
            break;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    if stream.write_all(HANDSHAKE_ACK).await.is_err() {
        return;
    }

    let mut framed = Framed::new(stream, MessageCodec::default());
    while let Some(Ok(message)) = framed.next().await {
        if let Message::Request(_) = message {
            if hang_up {
                return;
            }
            if framed.send(Message::Response(Response::ok_empty())).await.is_err() {
                return;
            }
        }
    }
}
