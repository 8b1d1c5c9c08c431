//! Bare protocol client
//!
//! Panics on anything unexpected; tests assert on the happy path and use
//! [`read_until_closed`] to observe the server dropping a connection.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use yyspider_common::auth::{build_handshake, HANDSHAKE_ACK};
use yyspider_common::codec::encode_frame;
use yyspider_common::{Action, Message, MessageCodec, Request, Response};

const WAIT: Duration = Duration::from_secs(5);

pub struct RawClient {
    framed: Framed<TcpStream, MessageCodec>,
}

impl RawClient {
    /// Connect and authenticate as `name`
    pub async fn connect(addr: SocketAddr, name: &str, key: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(build_handshake(name, key).as_bytes())
            .await
            .unwrap();

        let mut ack = [0u8; 4];
        tokio::time::timeout(WAIT, stream.read_exact(&mut ack))
            .await
            .expect("no handshake ack")
            .unwrap();
        assert_eq!(&ack, HANDSHAKE_ACK);

        RawClient {
            framed: Framed::new(stream, MessageCodec::default()),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    /// Frame an arbitrary value as a MessagePack map, bypassing the typed messages
    pub async fn send_raw(&mut self, value: &Value) {
        let payload = rmp_serde::to_vec_named(value).unwrap();
        let frame = encode_frame(&payload).unwrap();
        self.framed.get_mut().write_all(&frame).await.unwrap();
    }

    /// Next message from the server, or None if the connection closed
    pub async fn next_message(&mut self) -> Option<Message> {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            Ok(Some(Err(_))) | Ok(None) => None,
            Err(_) => panic!("timed out waiting for a message"),
        }
    }

    /// Send a request and wait for its response, skipping echoes
    pub async fn request(&mut self, action: Action, coll_name: &str, data: Value) -> Response {
        self.send(Message::Request(Request::new(action, coll_name, data)))
            .await;
        loop {
            match self.next_message().await {
                Some(Message::Response(response)) => return response,
                Some(Message::Echo) => continue,
                other => panic!("expected a response, got {:?}", other),
            }
        }
    }

    pub fn into_stream(self) -> TcpStream {
        self.framed.into_inner()
    }
}

/// Read until the server closes `stream`, returning everything received
///
/// A reset counts as closed.
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("server did not close the connection");
        match read {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}
