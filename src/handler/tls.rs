/// TLS 中间人
///
/// 两次握手串行进行，状态依次为：
/// 等待 ClientHello → 上游握手 → 恢复下游握手 → 转发。
/// 上游协商出的 ALPN 决定下游只能提供的那一个协议，保证两侧一致。
use rustls::pki_types::ServerName;
use rustls::server::Acceptor;
use tokio::io::AsyncWriteExt;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, info};

use super::{bypass, http11, http2};
use crate::engine::Engine;
use crate::error::{InterceptStage, Result, Side, TunnelError};
use crate::stream::Stream;
use crate::tls;
use crate::tunnel::{Tunnel, TunnelInfo};

pub async fn handle(tunnel: Tunnel, server_names: Vec<String>, engine: &Engine) -> Result<()> {
    let (info, downstream, upstream) = tunnel.into_parts();
    let (tunnel, negotiated) = intercept(&info, downstream, upstream, &server_names, engine).await?;
    debug!(
        tunnel = %info.id,
        decrypted = %tunnel.id(),
        stage = %InterceptStage::Relaying,
        alpn = ?negotiated.as_deref().map(String::from_utf8_lossy),
        "tls intercepted"
    );

    match negotiated.as_deref() {
        Some(b"h2") => http2::handle(tunnel, engine.relay()).await,
        Some(b"http/1.1") => http11::handle(tunnel, engine.relay()).await,
        Some(other) => {
            info!(
                tunnel = %tunnel.id(),
                alpn = %String::from_utf8_lossy(other),
                "unsupported application protocol, bypassing"
            );
            bypass::handle(tunnel).await
        }
        None => {
            let mut tunnel = tunnel;
            let handler = engine.decrypted_detector().detect(&mut tunnel).await;
            debug!(tunnel = %tunnel.id(), handler = %handler, "decrypted protocol detected");
            handler.handle(tunnel, engine).await
        }
    }
}

/// 完成两侧握手，返回解密后的隧道和两侧协商一致的协议
async fn intercept(
    info: &TunnelInfo,
    downstream: Stream,
    upstream: Stream,
    server_names: &[String],
    engine: &Engine,
) -> Result<(Tunnel, Option<Vec<u8>>)> {
    debug!(tunnel = %info.id, stage = %InterceptStage::AwaitingClientHello, "tls intercept");
    let start = LazyConfigAcceptor::new(Acceptor::default(), downstream)
        .await
        .map_err(|e| {
            TunnelError::handshake(Side::Downstream, InterceptStage::AwaitingClientHello, e)
        })?;

    let hello = start.client_hello();
    let sni = hello
        .server_name()
        .map(str::to_string)
        .or_else(|| server_names.first().cloned());
    let offered: Vec<Vec<u8>> = hello
        .alpn()
        .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
        .unwrap_or_default();

    // 上游使用与客户端相同的 SNI 和 ALPN 候选列表
    debug!(
        tunnel = %info.id,
        stage = %InterceptStage::UpstreamHandshaking,
        sni = ?sni,
        offered = offered.len(),
        "tls intercept"
    );
    let server_name = sni
        .as_deref()
        .and_then(|host| ServerName::try_from(host.to_string()).ok())
        .unwrap_or_else(|| ServerName::IpAddress(info.dst.ip().into()));
    let connector = TlsConnector::from(tls::client_config_with_alpn(
        engine.upstream_tls(),
        offered,
    ));
    let mut upstream = connector
        .connect(server_name, upstream)
        .await
        .map_err(|e| {
            TunnelError::handshake(Side::Upstream, InterceptStage::UpstreamHandshaking, e)
        })?;
    let negotiated = upstream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);

    debug!(tunnel = %info.id, stage = %InterceptStage::DownstreamResuming, "tls intercept");
    let host = sni.unwrap_or_else(|| info.dst.ip().to_string());
    let config = match engine
        .ca()
        .issue_leaf(&host)
        .and_then(|leaf| tls::leaf_server_config(leaf, negotiated.as_deref()))
    {
        Ok(config) => config,
        Err(e) => {
            let _ = upstream.shutdown().await;
            return Err(e);
        }
    };

    let mut downstream = match start.into_stream(config).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = upstream.shutdown().await;
            return Err(TunnelError::handshake(
                Side::Downstream,
                InterceptStage::DownstreamResuming,
                e,
            ));
        }
    };

    let agreed = downstream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
    if agreed != negotiated {
        let _ = tokio::join!(downstream.shutdown(), upstream.shutdown());
        return Err(TunnelError::protocol_mismatch(
            agreed.as_deref(),
            negotiated.as_deref(),
        ));
    }

    let tunnel = Tunnel::with_info(
        TunnelInfo::decrypted(info.src, info.dst),
        Stream::from_io(downstream),
        Stream::from_io(upstream),
    );
    Ok((tunnel, negotiated))
}
