//! Per-connection protocol state machine
//!
//! A connection starts in the handshake state: raw bytes are read until a
//! complete `<name>@@@***<hash>` has arrived. After a successful handshake
//! the server answers `OK!!`, registers the peer and switches to framed
//! MessagePack traffic. Any bytes that arrived after the handshake become
//! the start of the framed stream.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use yyspider_common::auth::{
    authenticate, scan_handshake, Credentials, HandshakeScan, HANDSHAKE_ACK,
};
use yyspider_common::{Error, Message, MessageCodec, Response, Result};

use crate::registry::PeerHandle;
use crate::server::ServerContext;

/// Messages that may wait for a busy connection writer
const OUTBOUND_BUFFER: usize = 64;

/// Read and verify the unframed handshake
///
/// Returns the credentials and whatever was read past the handshake.
pub async fn read_handshake(stream: &mut TcpStream, secret_key: &str) -> Result<(Credentials, BytesMut)> {
    let mut buf = BytesMut::with_capacity(128);

    loop {
        if let HandshakeScan::Complete { len } = scan_handshake(&buf)? {
            let handshake = buf.split_to(len);
            let credentials = authenticate(&handshake, secret_key)?;
            return Ok((credentials, buf));
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Drive one client connection to completion
///
/// Never panics on bad input; every failure ends with the socket dropped.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) {
    let timeout = ctx.config.handshake_timeout();
    let handshake = tokio::time::timeout(timeout, read_handshake(&mut stream, &ctx.config.secret_key)).await;

    let (credentials, leftover) = match handshake {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(Error::ConnectionClosed)) => {
            debug!(%peer_addr, "Closed during handshake");
            return;
        }
        Ok(Err(e)) => {
            warn!(%peer_addr, "Handshake rejected: {}", e);
            return;
        }
        Err(_) => {
            warn!(%peer_addr, "Handshake timed out after {:?}", timeout);
            return;
        }
    };

    if let Err(e) = stream.write_all(HANDSHAKE_ACK).await {
        warn!(%peer_addr, name = %credentials.name, "Failed to acknowledge handshake: {}", e);
        return;
    }

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let handle = PeerHandle::new(credentials.name.clone(), peer_addr.to_string(), tx);
    let conn_id = handle.conn_id;

    if let Some(displaced) = ctx.registry.register(handle).await {
        info!(
            name = %credentials.name,
            old_peer = %displaced.peer_addr,
            %peer_addr,
            "Client reconnected, replacing previous connection"
        );
    } else {
        info!(name = %credentials.name, %peer_addr, "Client authenticated");
    }

    let mut parts = FramedParts::new::<Message>(stream, MessageCodec::new(ctx.config.max_frame_len));
    parts.read_buf = leftover;
    let framed = Framed::from_parts(parts);

    match serve_frames(framed, rx, &ctx, &credentials.name, &shutdown).await {
        Ok(()) => info!(name = %credentials.name, %peer_addr, "Client disconnected"),
        Err(e) => warn!(name = %credentials.name, %peer_addr, "Connection aborted: {}", e),
    }

    ctx.registry.unregister(&credentials.name, conn_id).await;
}

/// Framed phase: answer requests, forward routed messages
async fn serve_frames(
    mut framed: Framed<TcpStream, MessageCodec>,
    mut outbound: mpsc::Receiver<Message>,
    ctx: &ServerContext,
    name: &str,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(name, "Closing connection for shutdown");
                return Ok(());
            }
            inbound = framed.next() => {
                let message = match inbound {
                    None => return Ok(()),
                    Some(result) => result?,
                };

                match message {
                    Message::Request(request) => {
                        trace!(name, action = %request.action, coll_name = %request.coll_name, "Request");
                        let response = ctx.db.handle_request(&request).await;
                        send_response(&mut framed, response, name).await?;
                    }
                    Message::Echo => {
                        trace!(name, "Echo");
                    }
                    Message::Response(_) => {
                        return Err(Error::Protocol("unexpected RESPONSE_MESSAGE from client".to_string()));
                    }
                }
            }
            Some(message) = outbound.recv() => {
                framed.send(message).await?;
            }
        }
    }
}

/// Send a response, answering `FAIL` instead when it cannot be framed
///
/// The encoder rejects a message before writing any of it, so the stream
/// is still clean for the fallback.
async fn send_response(
    framed: &mut Framed<TcpStream, MessageCodec>,
    response: Response,
    name: &str,
) -> Result<()> {
    match framed.send(Message::Response(response)).await {
        Err(e @ (Error::FrameTooLarge { .. } | Error::Encode(_))) => {
            warn!(name, "Response not sendable, answering FAIL: {}", e);
            framed.send(Message::Response(Response::fail())).await
        }
        other => other,
    }
}
