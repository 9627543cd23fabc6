/// TLS ClientHello 解析
///
/// 只读取预读缓冲区中的记录，不消费任何字节。
use std::sync::Arc;
use tracing::debug;

use super::DetectResult;
use crate::allow_list::AllowList;
use crate::handler::Handler;
use crate::tunnel::Tunnel;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const MAX_RECORD_LEN: usize = 65536;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_HOST: u8 = 0x00;

/// 首个 TLS 记录的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// 需要更多字节；已知时携带记录总长度
    Incomplete { needed: usize },
    NotClientHello,
    Parsed { server_names: Vec<String> },
}

/// 解析 `buf` 中的首个 TLS 记录。
///
/// 扩展块长度为零或扩展数据被截断时，仍返回 `Parsed`，
/// 携带已收集到的主机名。
pub fn parse_client_hello(buf: &[u8]) -> ClientHello {
    if buf.len() < RECORD_HEADER_LEN {
        return ClientHello::Incomplete {
            needed: RECORD_HEADER_LEN,
        };
    }

    let content_type = buf[0];
    let (major, minor) = (buf[1], buf[2]);
    let payload_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if content_type != CONTENT_TYPE_HANDSHAKE
        || major != 3
        || minor > 4
        || payload_len == 0
        || payload_len > MAX_RECORD_LEN
    {
        return ClientHello::NotClientHello;
    }

    let record_len = RECORD_HEADER_LEN + payload_len;
    if buf.len() < record_len {
        return ClientHello::Incomplete { needed: record_len };
    }
    let payload = &buf[RECORD_HEADER_LEN..record_len];

    let mut reader = Reader::new(payload);
    let handshake_len = match (reader.u8(), reader.u24()) {
        (Some(HANDSHAKE_CLIENT_HELLO), Some(len)) => len,
        _ => return ClientHello::NotClientHello,
    };
    if payload_len < 4 + handshake_len {
        return ClientHello::NotClientHello;
    }

    let mut body = Reader::new(&payload[4..4 + handshake_len]);
    let extensions_len = match walk_to_extensions(&mut body) {
        Some(len) => len,
        None => return ClientHello::NotClientHello,
    };

    let available = body.remaining().min(extensions_len);
    let extensions = body.bytes(available).unwrap_or_default();

    ClientHello::Parsed {
        server_names: server_names(extensions),
    }
}

/// version, random, session id, cipher suites, compression methods, extensions length
fn walk_to_extensions(body: &mut Reader<'_>) -> Option<usize> {
    body.skip(2)?;
    body.skip(32)?;
    let session_id_len = body.u8()? as usize;
    body.skip(session_id_len)?;
    let cipher_suites_len = body.u16()? as usize;
    body.skip(cipher_suites_len)?;
    let compression_len = body.u8()? as usize;
    body.skip(compression_len)?;
    Some(body.u16()? as usize)
}

fn server_names(extensions: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut reader = Reader::new(extensions);

    while let (Some(ext_type), Some(ext_len)) = (reader.u16(), reader.u16()) {
        let Some(data) = reader.bytes(ext_len as usize) else {
            break;
        };
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut list = Reader::new(data);
        let Some(list_len) = list.u16() else {
            break;
        };
        let Some(entries) = list.bytes(list_len as usize) else {
            break;
        };

        let mut entries = Reader::new(entries);
        while let (Some(name_type), Some(name_len)) = (entries.u8(), entries.u16()) {
            let Some(name) = entries.bytes(name_len as usize) else {
                break;
            };
            if name_type == SERVER_NAME_HOST {
                if let Ok(name) = std::str::from_utf8(name) {
                    names.push(name.to_string());
                }
            }
        }
    }

    names
}

/// 大端字节读取游标，越界时返回 None
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.bytes(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }
}

/// TLS 嗅探器，匹配后按白名单决定拦截还是透传
#[derive(Debug, Clone)]
pub struct TlsSniffer {
    allow_list: Arc<AllowList>,
}

impl TlsSniffer {
    pub fn new(allow_list: Arc<AllowList>) -> Self {
        Self { allow_list }
    }

    pub async fn sniff(&self, tunnel: &mut Tunnel) -> DetectResult {
        let mut want = RECORD_HEADER_LEN;
        loop {
            let parsed = match tunnel.downstream.peek(want).await {
                Ok(buf) => parse_client_hello(buf),
                Err(e) => return DetectResult::from_peek_error(&e),
            };

            match parsed {
                ClientHello::Incomplete { needed } if needed > want => want = needed,
                ClientHello::Incomplete { .. } => return DetectResult::Possible,
                ClientHello::NotClientHello => return DetectResult::Never,
                ClientHello::Parsed { server_names } => {
                    return DetectResult::Matched(self.select(tunnel, server_names));
                }
            }
        }
    }

    fn select(&self, tunnel: &Tunnel, server_names: Vec<String>) -> Handler {
        if self.allow_list.permits(tunnel.dst().ip(), &server_names) {
            debug!(
                tunnel = %tunnel.id(),
                dst = %tunnel.dst(),
                names = ?server_names,
                "allow-listed, skipping interception"
            );
            return Handler::ByPass;
        }
        Handler::Tls { server_names }
    }
}
