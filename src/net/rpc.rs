//! Outbound peer RPC: one short-lived TCP connection per call.
//!
//! The dialled server runs the same dispatcher loop it runs for clients, so
//! a call is send-request, await-reply, then the polite disconnect exchange.
//! Latency is dominated by network hops; no pooling.

use super::frame;
use super::message::{Reply, Request};
use super::NetError;
use crate::types::NetAddress;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Send `request` to `target` and return its reply. The connect phase is
/// bounded by `connect_timeout`; the exchange itself blocks until the peer
/// answers or the connection drops.
pub async fn call(
    target: &NetAddress,
    request: &Request,
    connect_timeout: Duration,
) -> Result<Reply, NetError> {
    let endpoint = target
        .endpoint()
        .ok_or_else(|| NetError::BadEndpoint(target.clone()))?;

    let mut stream = timeout(connect_timeout, TcpStream::connect(endpoint.as_str()))
        .await
        .map_err(|_| NetError::ConnectTimeout(endpoint.clone()))??;

    frame::write_message(&mut stream, &request.to_wire()).await?;
    let body = frame::read_frame(&mut stream)
        .await?
        .ok_or(NetError::ConnectionClosed)?;
    let reply: Reply = serde_json::from_slice(&body)?;
    trace!(%target, status = reply.status.code(), "peer call complete");

    // Polite teardown, best effort; the reply is already in hand.
    let _ = frame::write_message(&mut stream, &Request::Disconnect.to_wire()).await;
    let _ = frame::read_frame(&mut stream).await;

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_placeholder_endpoints() {
        let err = call(
            &NetAddress::client(),
            &Request::DumpCache,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::BadEndpoint(_)));
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_io_error() {
        // Port 1 on loopback: nothing listens there.
        let err = call(
            &NetAddress::new("127.0.0.1", 1),
            &Request::DumpCache,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            NetError::Io(_) | NetError::ConnectTimeout(_)
        ));
    }
}
