//! One authenticated connection to the coordinator

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;
use yyspider_common::auth::{build_handshake, HandshakeError, HANDSHAKE_ACK};
use yyspider_common::{Error, Message, MessageCodec, Request, Response, Result};

pub struct ServerConnection {
    framed: Framed<TcpStream, MessageCodec>,
}

impl ServerConnection {
    /// Connect and authenticate
    ///
    /// A refused or unreachable server surfaces as `Error::Io`; everything
    /// after the TCP connect (including a silent close) as `Error::Auth` or
    /// `Error::Timeout`.
    pub async fn open(
        addr: &str,
        name: &str,
        secret_key: &str,
        max_frame_len: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;

        stream.write_all(build_handshake(name, secret_key).as_bytes()).await?;

        let mut ack = [0u8; 4];
        match tokio::time::timeout(timeout, stream.read_exact(&mut ack)).await {
            Err(_) => return Err(Error::Timeout("waiting for handshake ack".to_string())),
            // Server drops rejected clients without a word
            Ok(Err(_)) => return Err(Error::Auth(HandshakeError::Rejected)),
            Ok(Ok(_)) if &ack != HANDSHAKE_ACK => return Err(Error::Auth(HandshakeError::Rejected)),
            Ok(Ok(_)) => {}
        }

        Ok(Self {
            framed: Framed::new(stream, MessageCodec::new(max_frame_len)),
        })
    }

    /// Send `request` and read until its response arrives
    ///
    /// A request too large to frame fails with `Error::Unsendable` before
    /// anything is written, so the connection stays usable.
    pub async fn request(&mut self, request: Request, timeout: Duration) -> Result<Response> {
        self.framed
            .send(Message::Request(request))
            .await
            .map_err(|e| match e {
                Error::FrameTooLarge { len, max } => {
                    Error::Unsendable(format!("request of {} bytes exceeds the {} byte frame limit", len, max))
                }
                Error::Encode(e) => Error::Unsendable(e.to_string()),
                other => other,
            })?;

        let read = async {
            loop {
                match self.framed.next().await {
                    None => return Err(Error::ConnectionClosed),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Message::Response(response))) => return Ok(response),
                    Some(Ok(Message::Echo)) => trace!("Skipping server echo"),
                    Some(Ok(Message::Request(_))) => {
                        return Err(Error::Protocol("unexpected REQUEST_MESSAGE from server".to_string()))
                    }
                }
            }
        };

        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| Error::Timeout(format!("no response within {:?}", timeout)))?
    }

    pub async fn echo(&mut self) -> Result<()> {
        self.framed.send(Message::Echo).await
    }
}
