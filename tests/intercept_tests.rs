/// End-to-end tests through the proxy listener over real TCP
mod common;

use common::*;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tproxy_mitm::AllowList;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";

#[tokio::test]
async fn test_unknown_protocol_bypassed_byte_for_byte() {
    let ca = test_ca("Bypass Root");
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine(ca.clone(), &ca, AllowList::new(), observer.clone());
    let origin = start_echo_server().await;
    let proxy = start_proxy(engine, origin).await;

    let payload: Vec<u8> = (0..1500).map(|i| b'a' + (i % 26) as u8).collect();
    let mut client = TcpStream::connect(proxy).await.unwrap();

    let started = Instant::now();
    client.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();

    assert_eq!(echoed, payload);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_server_speaks_first_after_detection_window() {
    let ca = test_ca("Banner Root");
    let engine = engine(
        ca.clone(),
        &ca,
        AllowList::new(),
        Arc::new(RecordingObserver::default()),
    );
    let origin = start_banner_server(b"220 ready\r\n").await;
    let proxy = start_proxy(engine, origin).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut banner = [0u8; 11];
    timeout(Duration::from_secs(5), client.read_exact(&mut banner))
        .await
        .expect("banner not relayed")
        .unwrap();
    assert_eq!(&banner, b"220 ready\r\n");

    client.write_all(b"QUIT\r\n").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"QUIT\r\n");
}

#[tokio::test]
async fn test_plain_http_relayed_and_observed() {
    let ca = test_ca("HTTP Root");
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine(ca.clone(), &ca, AllowList::new(), observer.clone());
    let origin = start_http_origin(RESPONSE).await;
    let proxy = start_proxy(engine, origin).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; RESPONSE.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    assert_eq!(response, RESPONSE);

    let events = observer.wait_for(2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].url, "http://a/");
    assert_eq!(events[1].status(), Some(200));
    assert_eq!(events[1].body.as_text(), "hi");
}

#[tokio::test]
async fn test_tls_intercepted_with_issued_leaf() {
    let proxy_ca = test_ca("Proxy Root");
    let origin_ca = test_ca("Origin Root");
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine(
        proxy_ca.clone(),
        &origin_ca,
        AllowList::new(),
        observer.clone(),
    );
    let origin = start_https_origin(&origin_ca, "example.test", &["http/1.1"], RESPONSE).await;
    let proxy = start_proxy(engine, origin).await;

    // 客户端只信任代理的根证书，握手成功说明证书由代理签发
    let connector = connector(&proxy_ca, &["h2", "http/1.1"]);
    let tcp = TcpStream::connect(proxy).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("example.test").unwrap(), tcp)
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; RESPONSE.len()];
    timeout(Duration::from_secs(5), tls.read_exact(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    assert_eq!(response, RESPONSE);

    let events = observer.wait_for(2).await;
    assert_eq!(events[0].url, "https://example.test/secure");
    assert_eq!(events[1].body.as_text(), "hi");
}

#[tokio::test]
async fn test_allow_listed_domain_is_not_intercepted() {
    let proxy_ca = test_ca("Proxy Root");
    let origin_ca = test_ca("Origin Root");
    let allow_list = AllowList::from_entries(Vec::<&str>::new(), ["*.bank.example"]).unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine(proxy_ca, &origin_ca, allow_list, observer.clone());
    let origin = start_https_origin(&origin_ca, "www.bank.example", &[], RESPONSE).await;
    let proxy = start_proxy(engine, origin).await;

    // 客户端只信任源站的根证书，握手成功说明连接未被解密
    let connector = connector(&origin_ca, &[]);
    let tcp = TcpStream::connect(proxy).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("www.bank.example").unwrap(), tcp)
        .await
        .unwrap();

    tls.write_all(b"GET / HTTP/1.1\r\nHost: www.bank.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; RESPONSE.len()];
    tls.read_exact(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client() {
    let ca = test_ca("Unreachable Root");
    let engine = engine(
        ca.clone(),
        &ca,
        AllowList::new(),
        Arc::new(RecordingObserver::default()),
    );
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = start_proxy(engine, closed).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("client was not closed");
    assert!(read.is_err() || buf.is_empty());
}
