/// HTTP/1.1 中继
///
/// 逐个读取请求并转发，再读取对应的响应并回传。报文字节原样转发，
/// 消息体只截取前 N 字节做预览。`101 Switching Protocols` 之后改为透传。
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{bypass, finish, RelayContext};
use crate::error::{is_benign_io_error, Result, TunnelError};
use crate::observe::{Direction, HttpEvent};
use crate::preview::{BodyPreview, PreviewReader};
use crate::stream::Stream;
use crate::tunnel::Tunnel;

/// 报文头最大长度
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// 最多解析的头部数量
const MAX_HEADERS: usize = 128;

/// chunk 大小行、trailer 行的最大长度
const MAX_LINE_BYTES: usize = 8 * 1024;

type Headers = Vec<(String, String)>;

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    headers: Headers,
    len: usize,
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Headers,
    len: usize,
}

/// 报文头之后消息体的定界方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Closed,
    Upgraded,
}

pub async fn handle(mut tunnel: Tunnel, relay: &RelayContext) -> Result<()> {
    match exchange(&mut tunnel, relay).await {
        Ok(Outcome::Upgraded) => bypass::handle(tunnel).await,
        Ok(Outcome::Closed) => finish(tunnel, Ok(())).await,
        Err(e) => finish(tunnel, Err(e)).await,
    }
}

async fn exchange(tunnel: &mut Tunnel, relay: &RelayContext) -> Result<Outcome> {
    loop {
        let Some(request) = read_request_head(&mut tunnel.downstream).await? else {
            debug!(tunnel = %tunnel.id(), "client closed at request boundary");
            return Ok(Outcome::Closed);
        };

        let host = header(&request.headers, "host")
            .map(str::to_string)
            .unwrap_or_else(|| tunnel.dst().to_string());
        let url = if request.target.starts_with('/') {
            format!("{}://{}{}", tunnel.scheme(), host, request.target)
        } else {
            request.target.clone()
        };

        let framing = request_framing(&request.headers)?;
        forward_buffered(&mut tunnel.downstream, &mut tunnel.upstream, request.len).await?;
        let mut early = None;
        if framing != Framing::Empty && has_token(&request.headers, "expect", "100-continue") {
            early = await_continue(tunnel).await?;
        }
        // 上游未读请求体就给出最终响应时，本次交换后关闭连接
        let body_skipped = early.is_some();
        let mut preview = BodyPreview::new(relay.preview_limit);
        if !body_skipped {
            forward_body(
                &mut tunnel.downstream,
                &mut tunnel.upstream,
                framing,
                &mut preview,
            )
            .await?;
        }
        tunnel.upstream.flush().await.map_err(TunnelError::Relay)?;

        let mut event = HttpEvent {
            tunnel: tunnel.id().to_string(),
            direction: Direction::Request,
            method: request.method.clone(),
            host,
            url,
            headers: request.headers,
            body: preview,
        };
        relay.observer.observe(&event);

        loop {
            let response = match early.take() {
                Some(response) => response,
                None => read_response_head(&mut tunnel.upstream)
                    .await?
                    .ok_or_else(upstream_closed)?,
            };
            forward_buffered(&mut tunnel.upstream, &mut tunnel.downstream, response.len).await?;

            if response.status == 101 {
                tunnel.downstream.flush().await.map_err(TunnelError::Relay)?;
                let websocket = has_token(&response.headers, "connection", "upgrade")
                    && header(&response.headers, "upgrade")
                        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
                if websocket {
                    info!(tunnel = %tunnel.id(), url = %event.url, "websocket bypassed");
                } else {
                    info!(tunnel = %tunnel.id(), url = %event.url, "protocol switched, bypassing");
                }
                event.direction = Direction::Response { status: 101 };
                event.headers = response.headers;
                event.body = BodyPreview::new(relay.preview_limit);
                relay.observer.observe(&event);
                return Ok(Outcome::Upgraded);
            }

            if (100..200).contains(&response.status) {
                // 中间响应：继续等待同一请求的最终响应
                tunnel.downstream.flush().await.map_err(TunnelError::Relay)?;
                continue;
            }

            let framing = response_framing(&request.method, response.status, &response.headers);
            let mut preview = BodyPreview::new(relay.preview_limit);
            forward_body(
                &mut tunnel.upstream,
                &mut tunnel.downstream,
                framing,
                &mut preview,
            )
            .await?;
            tunnel.downstream.flush().await.map_err(TunnelError::Relay)?;

            event.direction = Direction::Response {
                status: response.status,
            };
            event.headers = response.headers;
            event.body = preview;
            relay.observer.observe(&event);

            if framing == Framing::UntilClose || body_skipped {
                return Ok(Outcome::Closed);
            }
            break;
        }
    }
}

/// 请求带 `Expect: 100-continue` 时，客户端要等到 `100 Continue` 才发送请求体。
/// 先等上游的中间响应；客户端提前发出请求体时不再等待。
/// 返回 `Some` 表示上游没有等请求体就给出了响应（最终响应或 101）。
async fn await_continue(tunnel: &mut Tunnel) -> Result<Option<ResponseHead>> {
    tunnel.upstream.flush().await.map_err(TunnelError::Relay)?;
    let downstream = &mut tunnel.downstream;
    let upstream = &mut tunnel.upstream;
    loop {
        if !downstream.buffered().is_empty() {
            return Ok(None);
        }
        let response = tokio::select! {
            head = read_response_head(upstream) => head?.ok_or_else(upstream_closed)?,
            more = downstream.read_more() => {
                more.map_err(TunnelError::Relay)?;
                return Ok(None);
            }
        };
        match response.status {
            100 => {
                forward_buffered(upstream, downstream, response.len).await?;
                downstream.flush().await.map_err(TunnelError::Relay)?;
                return Ok(None);
            }
            102..=199 => {
                forward_buffered(upstream, downstream, response.len).await?;
                downstream.flush().await.map_err(TunnelError::Relay)?;
            }
            _ => return Ok(Some(response)),
        }
    }
}

fn upstream_closed() -> TunnelError {
    TunnelError::Relay(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "upstream closed before responding",
    ))
}

/// 读取直到缓冲区中有完整的请求头。返回 `None` 表示对端在新请求的
/// 第一个字节之前正常关闭。
async fn read_request_head(stream: &mut Stream) -> Result<Option<RequestHead>> {
    loop {
        if !stream.buffered().is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(stream.buffered()) {
                Ok(httparse::Status::Complete(len)) => {
                    return Ok(Some(RequestHead {
                        method: request.method.unwrap_or_default().to_string(),
                        target: request.path.unwrap_or_default().to_string(),
                        headers: collect_headers(request.headers),
                        len,
                    }));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(TunnelError::malformed(format!("invalid request: {}", e))),
            }
            if stream.buffered_len() > MAX_HEAD_BYTES {
                return Err(TunnelError::malformed("request head too large"));
            }
        }

        let n = match stream.read_more().await {
            Ok(n) => n,
            // 请求边界上的断开（例如 TLS 对端未发送 close_notify）按正常关闭处理
            Err(e) if is_benign_io_error(&e) && stream.buffered().is_empty() => return Ok(None),
            Err(e) => return Err(TunnelError::Relay(e)),
        };
        if n == 0 {
            if stream.buffered().is_empty() {
                return Ok(None);
            }
            return Err(truncated("request head"));
        }
    }
}

async fn read_response_head(stream: &mut Stream) -> Result<Option<ResponseHead>> {
    loop {
        if !stream.buffered().is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(stream.buffered()) {
                Ok(httparse::Status::Complete(len)) => {
                    return Ok(Some(ResponseHead {
                        status: response.code.unwrap_or_default(),
                        headers: collect_headers(response.headers),
                        len,
                    }));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => {
                    return Err(TunnelError::malformed(format!("invalid response: {}", e)))
                }
            }
            if stream.buffered_len() > MAX_HEAD_BYTES {
                return Err(TunnelError::malformed("response head too large"));
            }
        }

        if fill(stream).await? == 0 {
            if stream.buffered().is_empty() {
                return Ok(None);
            }
            return Err(truncated("response head"));
        }
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Headers {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

/// 逗号分隔的头部值中是否包含某个 token（不区分大小写）
fn has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(headers: &[(String, String)]) -> Option<bool> {
    let codings: Vec<&str> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    codings
        .last()
        .map(|last| last.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>> {
    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        for part in value.split(',') {
            let parsed = part.trim().parse::<u64>().map_err(|_| {
                TunnelError::malformed(format!("invalid Content-Length '{}'", value))
            })?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(TunnelError::malformed("conflicting Content-Length values"));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

fn request_framing(headers: &[(String, String)]) -> Result<Framing> {
    match is_chunked(headers) {
        Some(true) => return Ok(Framing::Chunked),
        Some(false) => {
            return Err(TunnelError::malformed(
                "request transfer coding does not end with chunked",
            ))
        }
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(0) | None => Framing::Empty,
        Some(n) => Framing::Length(n),
    })
}

fn response_framing(method: &str, status: u16, headers: &[(String, String)]) -> Framing {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Framing::Empty;
    }
    match is_chunked(headers) {
        Some(true) => return Framing::Chunked,
        Some(false) => return Framing::UntilClose,
        None => {}
    }
    match content_length(headers) {
        Ok(Some(0)) => Framing::Empty,
        Ok(Some(n)) => Framing::Length(n),
        Ok(None) | Err(_) => Framing::UntilClose,
    }
}

async fn fill(stream: &mut Stream) -> Result<usize> {
    stream.read_more().await.map_err(TunnelError::Relay)
}

fn truncated(what: &str) -> TunnelError {
    TunnelError::Relay(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("peer closed inside a {}", what),
    ))
}

/// 把 `from` 缓冲区中的 `len` 字节写到 `to` 并消费掉
async fn forward_buffered(from: &mut Stream, to: &mut Stream, len: usize) -> Result<()> {
    to.write_all(&from.buffered()[..len])
        .await
        .map_err(TunnelError::Relay)?;
    from.discard(len);
    Ok(())
}

async fn forward_body(
    from: &mut Stream,
    to: &mut Stream,
    framing: Framing,
    preview: &mut BodyPreview,
) -> Result<()> {
    match framing {
        Framing::Empty => Ok(()),
        Framing::Length(n) => forward_exact(from, to, n, preview).await,
        Framing::Chunked => forward_chunked(from, to, preview).await,
        Framing::UntilClose => {
            let mut reader = PreviewReader::new(&mut *from, preview);
            match tokio::io::copy(&mut reader, to).await {
                Ok(_) => Ok(()),
                Err(e) if is_benign_io_error(&e) => Ok(()),
                Err(e) => Err(TunnelError::Relay(e)),
            }
        }
    }
}

async fn forward_exact(
    from: &mut Stream,
    to: &mut Stream,
    len: u64,
    preview: &mut BodyPreview,
) -> Result<()> {
    let mut reader = PreviewReader::new((&mut *from).take(len), preview);
    let copied = tokio::io::copy(&mut reader, to)
        .await
        .map_err(TunnelError::Relay)?;
    if copied < len {
        return Err(truncated("message body"));
    }
    Ok(())
}

/// 原样转发 chunked 消息体，预览只记录 chunk 数据
async fn forward_chunked(
    from: &mut Stream,
    to: &mut Stream,
    preview: &mut BodyPreview,
) -> Result<()> {
    loop {
        let line = read_line(from).await?;
        let size = parse_chunk_size(&from.buffered()[..line])?;
        forward_buffered(from, to, line).await?;

        if size == 0 {
            // trailer 区域以空行结束
            loop {
                let line = read_line(from).await?;
                forward_buffered(from, to, line).await?;
                if line == 2 {
                    return Ok(());
                }
            }
        }

        forward_exact(from, to, size, preview).await?;
        let line = read_line(from).await?;
        if line != 2 {
            return Err(TunnelError::malformed("chunk data not followed by CRLF"));
        }
        forward_buffered(from, to, line).await?;
    }
}

/// 缓冲区中下一行（以 CRLF 结尾）的长度，不够时继续读取
async fn read_line(stream: &mut Stream) -> Result<usize> {
    let mut searched: usize = 0;
    loop {
        let buffered = stream.buffered();
        let start = searched.saturating_sub(1);
        if let Some(pos) = buffered[start..].windows(2).position(|w| w == b"\r\n") {
            return Ok(start + pos + 2);
        }
        searched = buffered.len();
        if searched > MAX_LINE_BYTES {
            return Err(TunnelError::malformed("chunk line too long"));
        }
        if fill(stream).await? == 0 {
            return Err(truncated("chunked body"));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| TunnelError::malformed("chunk size is not ASCII"))?;
    let size = line
        .trim_end_matches("\r\n")
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| TunnelError::malformed(format!("invalid chunk size '{}'", size)))
}
