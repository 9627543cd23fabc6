use super::DetectResult;
use crate::handler::Handler;
use crate::stream::Stream;

/// HTTP/2 连接前言
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub async fn sniff(stream: &mut Stream) -> DetectResult {
    match stream.peek(PREFACE.len()).await {
        Ok(head) if head == PREFACE => DetectResult::Matched(Handler::Http2),
        Ok(_) => DetectResult::Never,
        Err(e) => DetectResult::from_peek_error(&e),
    }
}
