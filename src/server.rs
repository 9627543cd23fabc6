/// 透明代理监听
///
/// 接受被内核重定向过来的连接，恢复原始目标地址，连接真实上游，
/// 然后把两条连接组成隧道交给引擎处理。每条连接一个任务，互不影响。
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ProxyConfig};
use crate::engine::Engine;
use crate::error::{Result, TunnelError};
use crate::tunnel::Tunnel;

const LISTEN_BACKLOG: i32 = 1024;

/// 接入路径的设置
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    pub transparent: bool,
    pub dial_timeout: Duration,
    pub connection_timeout: Duration,
    /// 调试用：固定的上游地址
    pub upstream_override: Option<SocketAddr>,
}

impl From<&ProxyConfig> for ServerOptions {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr,
            transparent: config.transparent,
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            connection_timeout: Duration::from_secs(config.connection_timeout_secs),
            upstream_override: config.upstream_override,
        }
    }
}

/// 加载配置并运行，直到收到 Ctrl+C
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(&config)?);
    let options = ServerOptions::from(&config.proxy);
    let listener = bind_listener(options.listen_addr, options.transparent)
        .with_context(|| format!("Failed to bind {}", options.listen_addr))?;

    info!(
        "Transparent proxy listening on {} (transparent: {})",
        options.listen_addr, options.transparent
    );
    if let Some(addr) = options.upstream_override {
        warn!("All connections are dialed to {} instead of their original destination", addr);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = serve(listener, engine, options) => {}
        _ = &mut shutdown => {
            info!("Received shutdown signal, stopping proxy...");
        }
    }

    info!("Proxy stopped");
    Ok(())
}

/// 创建监听套接字，按需开启 IP_TRANSPARENT
pub fn bind_listener(addr: SocketAddr, transparent: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if transparent {
        set_transparent(&socket, addr)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    if addr.is_ipv4() {
        socket.set_ip_transparent_v4(true)
    } else {
        warn!("IP_TRANSPARENT is only set for IPv4 listeners");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket, _addr: SocketAddr) -> io::Result<()> {
    warn!("Transparent mode is only supported on Linux");
    Ok(())
}

/// 持续接受连接，每条连接一个任务
pub async fn serve(listener: TcpListener, engine: Arc<Engine>, options: ServerOptions) {
    let options = Arc::new(options);
    loop {
        match listener.accept().await {
            Ok((inbound, src)) => {
                debug!("Accepted connection from {}", src);
                let engine = engine.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inbound, src, &engine, &options).await {
                        match e {
                            TunnelError::UpstreamUnavailable { .. } | TunnelError::Timeout { .. } => {
                                warn!("Connection from {}: {}", src, e)
                            }
                            _ => error!("Connection from {}: {}", src, e),
                        }
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    inbound: TcpStream,
    src: SocketAddr,
    engine: &Engine,
    options: &ServerOptions,
) -> Result<()> {
    let dst = match options.upstream_override {
        Some(addr) => addr,
        None => original_destination(&inbound)?,
    };
    if options.upstream_override.is_none() && is_self(&inbound, dst, options) {
        return Err(TunnelError::upstream_unavailable(
            dst.to_string(),
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "original destination is the proxy itself (connection not redirected?)",
            ),
        ));
    }

    let upstream = dial(dst, options.dial_timeout).await?;
    for stream in [&inbound, &upstream] {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    let tunnel = Tunnel::from_tcp(src, dst, inbound, upstream);
    info!(tunnel = %tunnel.id(), src = %src, dst = %dst, "tunnel open");
    let id = tunnel.id().to_string();

    let result = match tokio::time::timeout(options.connection_timeout, engine.handle(tunnel)).await
    {
        Ok(result) => result,
        Err(_) => Err(TunnelError::timeout(options.connection_timeout)),
    };
    debug!(tunnel = %id, "tunnel closed");
    result
}

/// 透明代理（TPROXY）模式下，被接受连接的本地地址即原始目标地址
fn original_destination(inbound: &TcpStream) -> Result<SocketAddr> {
    Ok(inbound.local_addr()?)
}

fn is_self(inbound: &TcpStream, dst: SocketAddr, options: &ServerOptions) -> bool {
    !options.transparent && inbound.local_addr().is_ok_and(|local| local == dst)
}

/// 带超时地连接原始目标
pub async fn dial(dst: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(dst)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::upstream_unavailable(dst.to_string(), e)),
        Err(_) => Err(TunnelError::upstream_unavailable(
            dst.to_string(),
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        )),
    }
}
