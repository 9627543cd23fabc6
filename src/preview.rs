/// 消息体预览
///
/// 转发消息体时只保留前 N 个字节用于日志，不缓冲整个消息体。
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// 默认预览长度
pub const DEFAULT_PREVIEW_BYTES: usize = 128;

/// 消息体前若干字节的有界截取
#[derive(Debug, Clone)]
pub struct BodyPreview {
    buf: Vec<u8>,
    limit: usize,
    total: u64,
}

impl BodyPreview {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(DEFAULT_PREVIEW_BYTES)),
            limit,
            total: 0,
        }
    }

    /// 记录一段消息体数据，只保留上限以内的部分
    pub fn record(&mut self, data: &[u8]) {
        self.total += data.len() as u64;
        let room = self.limit.saturating_sub(self.buf.len());
        if room > 0 {
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// 预览内容（非 UTF-8 字节做有损替换）
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// 已见到的消息体总字节数（含超出上限的部分）
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.buf.len() as u64
    }
}

/// 旁路读取器：数据原样透传，同时写入预览
pub struct PreviewReader<'a, R> {
    inner: R,
    preview: &'a mut BodyPreview,
}

impl<'a, R> PreviewReader<'a, R> {
    pub fn new(inner: R, preview: &'a mut BodyPreview) -> Self {
        Self { inner, preview }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PreviewReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let this = self.get_mut();
            this.preview.record(&buf.filled()[before..]);
        }
        result
    }
}
