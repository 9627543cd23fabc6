/// 透传中继
///
/// 先把探测阶段预读的字节按原顺序写到对端，再双向复制。
/// 单向 EOF 只半关闭对端写方向，另一方向继续；两个方向都结束才算完成，
/// 出现非良性错误时立即取消另一方向。
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::finish;
use crate::error::{is_benign_io_error, Result, TunnelError};
use crate::stream::Stream;
use crate::tunnel::Tunnel;

pub async fn handle(mut tunnel: Tunnel) -> Result<()> {
    debug!(tunnel = %tunnel.id(), dst = %tunnel.dst(), "bypass start");
    let result = relay(&mut tunnel.downstream, &mut tunnel.upstream).await;
    debug!(tunnel = %tunnel.id(), "bypass end");
    finish(tunnel, result).await
}

/// 双向复制，直到两个方向都结束
pub async fn relay(downstream: &mut Stream, upstream: &mut Stream) -> Result<()> {
    flush_buffered(downstream, upstream).await?;
    flush_buffered(upstream, downstream).await?;

    let (mut down_read, mut down_write) = tokio::io::split(downstream);
    let (mut up_read, mut up_write) = tokio::io::split(upstream);

    tokio::try_join!(
        pipe(&mut down_read, &mut up_write),
        pipe(&mut up_read, &mut down_write),
    )?;
    Ok(())
}

async fn flush_buffered(from: &mut Stream, to: &mut Stream) -> Result<()> {
    let pending = from.take_buffered();
    if pending.is_empty() {
        return Ok(());
    }
    to.write_all(&pending).await.map_err(TunnelError::Relay)?;
    to.flush().await.map_err(TunnelError::Relay)
}

async fn pipe<R, W>(from: &mut R, to: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy(from, to).await {
        Ok(_) => {}
        Err(e) if is_benign_io_error(&e) => {}
        Err(e) => return Err(TunnelError::Relay(e)),
    }
    // 把 EOF 传给对端
    if let Err(e) = to.shutdown().await {
        debug!("half-close failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::duplex_tunnel;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, mut origin, tunnel) = duplex_tunnel(8192);
        let relay = tokio::spawn(handle(tunnel));

        let payload: Vec<u8> = (0..1500).map(|i| b'a' + (i % 26) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        origin.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        let mut rest = Vec::new();
        origin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(origin);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_peeked_bytes_are_flushed_first() {
        let (mut client, mut origin, mut tunnel) = duplex_tunnel(8192);
        client.write_all(b"peeked").await.unwrap();
        tunnel.downstream.peek(6).await.unwrap();
        origin.write_all(b"banner").await.unwrap();
        tunnel.upstream.peek(6).await.unwrap();

        let relay = tokio::spawn(handle(tunnel));
        client.write_all(b"-after").await.unwrap();

        let mut received = [0u8; 12];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"peeked-after");

        let mut banner = [0u8; 6];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"banner");

        drop(origin);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(client);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_half_close_keeps_response() {
        let (mut client, mut origin, tunnel) = duplex_tunnel(1024);
        let relay = tokio::spawn(handle(tunnel));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        origin.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        origin.write_all(b"response").await.unwrap();
        origin.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_is_benign() {
        let (client, mut origin, tunnel) = duplex_tunnel(1024);
        let relay = tokio::spawn(handle(tunnel));

        drop(client);
        let mut rest = Vec::new();
        origin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        origin.write_all(b"late").await.unwrap();
        drop(origin);
        relay.await.unwrap().unwrap();
    }
}
