/// HTTP/2 中继
///
/// 下游以服务端角色接受流，上游以客户端角色复用一条连接。
/// 每个流独立转发，单个流失败时只向该流回 502，不影响整条连接。
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::header::HOST;
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use std::io;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::RelayContext;
use crate::error::{is_benign_io_error, Result, TunnelError};
use crate::observe::{Direction, HttpEvent};
use crate::preview::BodyPreview;
use crate::tunnel::{Tunnel, TunnelInfo};

pub async fn handle(tunnel: Tunnel, relay: &RelayContext) -> Result<()> {
    let (info, downstream, upstream) = tunnel.into_parts();
    debug!(tunnel = %info.id, dst = %info.dst, "h2 relay start");

    let mut connection = h2::server::handshake(downstream)
        .await
        .map_err(|e| TunnelError::Relay(h2_io(e)))?;
    let (sender, upstream_connection) = h2::client::handshake(upstream)
        .await
        .map_err(|e| TunnelError::Relay(h2_io(e)))?;

    let driver_id = info.id.clone();
    let driver = tokio::spawn(async move {
        if let Err(e) = upstream_connection.await {
            debug!(tunnel = %driver_id, "upstream h2 connection: {}", e);
        }
    });

    let mut streams = JoinSet::new();
    let mut result = Ok(());
    while let Some(next) = connection.accept().await {
        match next {
            Ok((request, respond)) => {
                streams.spawn(relay_stream(
                    info.clone(),
                    sender.clone(),
                    request,
                    respond,
                    relay.clone(),
                ));
            }
            Err(e) => {
                if !is_benign_h2_error(&e) {
                    result = Err(TunnelError::Relay(h2_io(e)));
                }
                break;
            }
        }
    }

    // 连接关闭前仍需驱动下游连接，让进行中的流把响应发完
    let drain = async {
        while let Some(joined) = streams.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(tunnel = %info.id, "h2 stream: {}", e),
                Err(e) => debug!(tunnel = %info.id, "h2 stream task: {}", e),
            }
        }
    };
    let closed = std::future::poll_fn(|cx| connection.poll_closed(cx));
    let (_, closed) = tokio::join!(drain, closed);
    if let Err(e) = closed {
        debug!(tunnel = %info.id, "downstream h2 connection: {}", e);
    }

    drop(sender);
    let _ = driver.await;
    debug!(tunnel = %info.id, "h2 relay end");
    result
}

async fn relay_stream(
    info: TunnelInfo,
    sender: SendRequest<Bytes>,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    relay: RelayContext,
) -> Result<()> {
    let (mut parts, request_body) = request.into_parts();

    let host = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| info.dst.to_string());
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}://{}{}", info.scheme(), host, path);
    parts.uri = url
        .parse::<Uri>()
        .map_err(|e| TunnelError::malformed(format!("invalid request target '{}': {}", url, e)))?;
    parts.version = Version::HTTP_2;

    let event = HttpEvent {
        tunnel: info.id.clone(),
        direction: Direction::Request,
        method: parts.method.to_string(),
        host,
        url,
        headers: header_pairs(&parts.headers),
        body: BodyPreview::new(relay.preview_limit),
    };

    let end_stream = request_body.is_end_stream();
    let opened = match sender.ready().await {
        Ok(mut sender) => sender.send_request(Request::from_parts(parts, ()), end_stream),
        Err(e) => Err(e),
    };
    let (pending, upstream_body) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            relay.observer.observe(&event);
            bad_gateway(&info, &event.url, &mut respond, h2_io(e));
            return Ok(());
        }
    };

    // 请求体与响应并行转发，源站可以在请求结束前开始响应
    let response_event = event.clone();
    let upload = upload(request_body, upstream_body, end_stream, event, &relay);
    let download = download(&info, pending, respond, response_event, &relay);
    tokio::pin!(upload, download);

    let mut uploaded = None;
    let downloaded = loop {
        tokio::select! {
            result = &mut upload, if uploaded.is_none() => uploaded = Some(result),
            result = &mut download => break result,
        }
    };
    let uploaded = match uploaded {
        Some(result) => result,
        None if matches!(downloaded, Ok(true)) => upload.await,
        // 响应失败后放弃剩余请求体
        None => Ok(()),
    };
    downloaded.and(uploaded)
}

/// 转发请求体到上游，结束后记录请求事件
async fn upload(
    mut body: RecvStream,
    mut sink: SendStream<Bytes>,
    end_stream: bool,
    mut event: HttpEvent,
    relay: &RelayContext,
) -> Result<()> {
    let relayed = if end_stream {
        Ok(())
    } else {
        relay_body(&mut body, &mut sink, &mut event.body).await
    };
    relay.observer.observe(&event);

    if let Err(e) = relayed {
        sink.send_reset(Reason::CANCEL);
        if !is_benign_io_error(&e) {
            return Err(TunnelError::Relay(e));
        }
    }
    Ok(())
}

/// 等待上游响应并转发给下游；上游失败时回 502 并返回 `Ok(false)`
async fn download(
    info: &TunnelInfo,
    pending: ResponseFuture,
    mut respond: SendResponse<Bytes>,
    mut event: HttpEvent,
    relay: &RelayContext,
) -> Result<bool> {
    let response = match pending.await {
        Ok(response) => response,
        Err(e) => {
            bad_gateway(info, &event.url, &mut respond, h2_io(e));
            return Ok(false);
        }
    };

    let (parts, mut response_body) = response.into_parts();
    event.direction = Direction::Response {
        status: parts.status.as_u16(),
    };
    event.headers = header_pairs(&parts.headers);

    let end_stream = response_body.is_end_stream();
    let mut sink = respond
        .send_response(Response::from_parts(parts, ()), end_stream)
        .map_err(|e| TunnelError::Relay(h2_io(e)))?;
    let relayed = if end_stream {
        Ok(())
    } else {
        relay_body(&mut response_body, &mut sink, &mut event.body).await
    };
    relay.observer.observe(&event);

    if let Err(e) = relayed {
        sink.send_reset(Reason::CANCEL);
        if !is_benign_io_error(&e) {
            return Err(TunnelError::Relay(e));
        }
    }
    Ok(true)
}

fn bad_gateway(info: &TunnelInfo, url: &str, respond: &mut SendResponse<Bytes>, error: io::Error) {
    warn!(tunnel = %info.id, url = %url, "upstream round trip failed: {}", error);
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    if let Err(e) = respond.send_response(response, true) {
        debug!(tunnel = %info.id, "sending 502: {}", e);
    }
}

async fn relay_body(
    source: &mut RecvStream,
    sink: &mut SendStream<Bytes>,
    preview: &mut BodyPreview,
) -> io::Result<()> {
    while let Some(frame) = source.data().await {
        let data = frame.map_err(h2_io)?;
        let len = data.len();
        preview.record(&data);
        let end_stream = source.is_end_stream();
        send_data(sink, data, end_stream).await?;
        source
            .flow_control()
            .release_capacity(len)
            .map_err(h2_io)?;
        if end_stream {
            return Ok(());
        }
    }

    match source.trailers().await.map_err(h2_io)? {
        Some(trailers) => sink.send_trailers(trailers).map_err(h2_io),
        None => sink.send_data(Bytes::new(), true).map_err(h2_io),
    }
}

/// 按对端授予的窗口分块发送
async fn send_data(sink: &mut SendStream<Bytes>, mut data: Bytes, end_stream: bool) -> io::Result<()> {
    if data.is_empty() {
        return sink.send_data(data, end_stream).map_err(h2_io);
    }

    while !data.is_empty() {
        sink.reserve_capacity(data.len());
        let available = match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(h2_io(e)),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 stream closed before capacity became available",
                ))
            }
        };
        if available == 0 {
            continue;
        }
        let chunk = data.split_to(available.min(data.len()));
        sink.send_data(chunk, end_stream && data.is_empty())
            .map_err(h2_io)?;
    }
    Ok(())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn h2_io(error: h2::Error) -> io::Error {
    if error.is_io() {
        match error.into_io() {
            Some(e) => e,
            None => io::Error::other("HTTP/2 I/O error"),
        }
    } else {
        io::Error::other(error)
    }
}

/// 对端关闭或正常 GOAWAY 不视为错误
fn is_benign_h2_error(error: &h2::Error) -> bool {
    if let Some(e) = error.get_io() {
        return is_benign_io_error(e);
    }
    error
        .reason()
        .is_some_and(|reason| reason == Reason::NO_ERROR || reason == Reason::CANCEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::MemoryObserver;
    use crate::tunnel::duplex_tunnel;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// 源站：回复 `hi <请求体>`，`/reset` 直接重置
    async fn serve_origin(io: DuplexStream) {
        let mut connection = h2::server::handshake(io).await.unwrap();
        while let Some(Ok((request, mut respond))) = connection.accept().await {
            tokio::spawn(async move {
                let path = request.uri().path().to_string();
                let authority = request
                    .uri()
                    .authority()
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                let mut body = request.into_body();
                let mut received = Vec::new();
                while let Some(chunk) = body.data().await {
                    let chunk = chunk.unwrap();
                    body.flow_control().release_capacity(chunk.len()).unwrap();
                    received.extend_from_slice(&chunk);
                }
                if path == "/reset" {
                    respond.send_reset(Reason::INTERNAL_ERROR);
                    return;
                }
                let response = Response::builder()
                    .status(200)
                    .header("x-authority", authority)
                    .body(())
                    .unwrap();
                let mut stream = respond.send_response(response, false).unwrap();
                let mut reply = b"hi ".to_vec();
                reply.extend_from_slice(&received);
                stream.send_data(Bytes::from(reply), true).unwrap();
            });
        }
    }

    async fn read_body(mut body: RecvStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.unwrap();
            body.flow_control().release_capacity(chunk.len()).unwrap();
            out.extend_from_slice(&chunk);
        }
        out
    }

    async fn wait_for_events(observer: &MemoryObserver, n: usize) -> Vec<HttpEvent> {
        for _ in 0..200 {
            let events = observer.events();
            if events.len() >= n {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        observer.events()
    }

    #[tokio::test]
    async fn test_streams_are_relayed_with_preview() {
        let (client_io, origin_io, tunnel) = duplex_tunnel(64 * 1024);
        let observer = Arc::new(MemoryObserver::default());
        let relay = RelayContext::new(128, observer.clone());
        tokio::spawn(async move { handle(tunnel, &relay).await });
        tokio::spawn(serve_origin(origin_io));

        let (client, connection) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let mut client = client.ready().await.unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("https://example.test/echo")
            .body(())
            .unwrap();
        let (response, mut stream) = client.send_request(request, false).unwrap();
        stream.send_data(Bytes::from_static(b"ping"), true).unwrap();

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-authority"], "example.test");
        assert_eq!(read_body(response.into_body()).await, b"hi ping");

        let events = wait_for_events(&observer, 2).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].url, "http://example.test/echo");
        assert_eq!(events[0].body.as_text(), "ping");
        assert_eq!(events[1].status(), Some(200));
        assert_eq!(events[1].body.as_text(), "hi ping");
    }

    #[tokio::test]
    async fn test_failed_stream_gets_bad_gateway() {
        let (client_io, origin_io, tunnel) = duplex_tunnel(64 * 1024);
        let relay = RelayContext::new(128, Arc::new(MemoryObserver::default()));
        tokio::spawn(async move { handle(tunnel, &relay).await });
        tokio::spawn(serve_origin(origin_io));

        let (client, connection) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let mut client = client.ready().await.unwrap();
        let request = Request::builder()
            .uri("https://example.test/reset")
            .body(())
            .unwrap();
        let (response, _) = client.send_request(request, true).unwrap();
        assert_eq!(response.await.unwrap().status(), StatusCode::BAD_GATEWAY);

        // 同一连接上的其他流不受影响
        let mut client = client.ready().await.unwrap();
        let request = Request::builder()
            .uri("https://example.test/ok")
            .body(())
            .unwrap();
        let (response, _) = client.send_request(request, true).unwrap();
        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response.into_body()).await, b"hi ");
    }

    /// 源站：先发响应头和 "hello"，再读完请求体并原样回写
    async fn serve_early_origin(io: DuplexStream) {
        let mut connection = h2::server::handshake(io).await.unwrap();
        while let Some(Ok((request, mut respond))) = connection.accept().await {
            tokio::spawn(async move {
                let response = Response::builder().status(200).body(()).unwrap();
                let mut stream = respond.send_response(response, false).unwrap();
                stream.send_data(Bytes::from_static(b"hello"), false).unwrap();
                let received = read_body(request.into_body()).await;
                stream.send_data(Bytes::from(received), true).unwrap();
            });
        }
    }

    #[tokio::test]
    async fn test_response_starts_before_request_ends() {
        let (client_io, origin_io, tunnel) = duplex_tunnel(64 * 1024);
        let observer = Arc::new(MemoryObserver::default());
        let relay = RelayContext::new(128, observer.clone());
        tokio::spawn(async move { handle(tunnel, &relay).await });
        tokio::spawn(serve_early_origin(origin_io));

        let (client, connection) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let mut client = client.ready().await.unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("https://example.test/stream")
            .body(())
            .unwrap();
        let (response, mut upload) = client.send_request(request, false).unwrap();
        upload.send_data(Bytes::from_static(b"first"), false).unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), response)
            .await
            .expect("response headers before request end")
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.data())
            .await
            .expect("response data before request end")
            .unwrap()
            .unwrap();
        body.flow_control().release_capacity(chunk.len()).unwrap();
        assert_eq!(&chunk[..], b"hello");

        upload.send_data(Bytes::from_static(b"second"), true).unwrap();
        assert_eq!(read_body(body).await, b"firstsecond");

        let events = wait_for_events(&observer, 2).await;
        assert_eq!(events[0].body.as_text(), "firstsecond");
        assert_eq!(events[1].body.as_text(), "hellofirstsecond");
    }
}
