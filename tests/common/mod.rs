//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tproxy_mitm::cert::generate_root;
use tproxy_mitm::server::{self, ServerOptions};
use tproxy_mitm::{
    AllowList, CertificateAuthority, DetectOptions, Engine, HttpEvent, Observer, RelayContext,
};

/// Collects every observed HTTP event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<HttpEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<HttpEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<HttpEvent> {
        for _ in 0..200 {
            let events = self.events();
            if events.len() >= n {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, event: &HttpEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Generate a throwaway root CA
pub fn test_ca(name: &str) -> Arc<CertificateAuthority> {
    let root = generate_root(name, "tproxy-mitm tests").expect("Failed to generate root");
    Arc::new(
        CertificateAuthority::from_pem(&root.cert_pem, &root.key_pem)
            .expect("Failed to load root"),
    )
}

pub fn client_config(ca: &CertificateAuthority, alpn: &[&str]) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.root_der().clone()).unwrap();
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    config
}

pub fn connector(ca: &CertificateAuthority, alpn: &[&str]) -> TlsConnector {
    TlsConnector::from(Arc::new(client_config(ca, alpn)))
}

/// Engine whose upstream trust is `upstream_ca` only.
pub fn engine(
    ca: Arc<CertificateAuthority>,
    upstream_ca: &CertificateAuthority,
    allow_list: AllowList,
    observer: Arc<RecordingObserver>,
) -> Arc<Engine> {
    Arc::new(Engine::new(
        ca,
        Arc::new(client_config(upstream_ca, &[])),
        Arc::new(allow_list),
        DetectOptions::default(),
        RelayContext::new(128, observer),
    ))
}

/// Start the proxy on an ephemeral port, dialing `origin` for every connection.
pub async fn start_proxy(engine: Arc<Engine>, origin: SocketAddr) -> SocketAddr {
    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = server::bind_listener(listen_addr, false).expect("Failed to bind proxy");
    let addr = listener.local_addr().unwrap();
    let options = ServerOptions {
        listen_addr: addr,
        transparent: false,
        dial_timeout: Duration::from_secs(2),
        connection_timeout: Duration::from_secs(30),
        upstream_override: Some(origin),
    };
    tokio::spawn(server::serve(listener, engine, options));
    addr
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Server that speaks first: writes `banner` on accept, then echoes.
pub async fn start_banner_server(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socket.write_all(banner).await.is_err() {
                    return;
                }
                let mut buf = vec![0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Reads one HTTP/1.1 request head and answers with `response`, once per connection.
async fn answer_http<S>(mut stream: S, response: &'static [u8])
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }
    let _ = stream.write_all(response).await;
    let _ = stream.flush().await;
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
}

/// Plain HTTP origin with a fixed response.
pub async fn start_http_origin(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(answer_http(socket, response));
        }
    });
    addr
}

/// HTTPS origin presenting a leaf for `host` issued by `ca`.
pub async fn start_https_origin(
    ca: &CertificateAuthority,
    host: &str,
    alpn: &[&str],
    response: &'static [u8],
) -> SocketAddr {
    let leaf = ca.issue_leaf(host).unwrap();
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain, leaf.key)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    answer_http(tls, response).await;
                }
            });
        }
    });
    addr
}
