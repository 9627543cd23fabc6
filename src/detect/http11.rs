use super::DetectResult;
use crate::handler::Handler;
use crate::stream::Stream;

/// 判断所需的最少字节数
pub const PEEK_LEN: usize = 7;

/// 请求方法（含结尾空格），区分大小写
pub const METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"PATCH ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"CONNECT ",
    b"TRACE ",
];

/// 匹配以已知方法名开头的请求行
///
/// `OPTIONS ` 和 `CONNECT ` 比首次预读多一个字节，
/// 前七个字节一致时再预读第八个字节。
pub async fn sniff(stream: &mut Stream) -> DetectResult {
    let head = match stream.peek(PEEK_LEN).await {
        Ok(head) => head.to_vec(),
        Err(e) => return DetectResult::from_peek_error(&e),
    };

    for method in METHODS {
        if method.len() <= PEEK_LEN {
            if head.starts_with(method) {
                return DetectResult::Matched(Handler::Http11);
            }
            continue;
        }

        if head[..] == method[..PEEK_LEN] {
            return match stream.peek(method.len()).await {
                Ok(full) if full == method => DetectResult::Matched(Handler::Http11),
                Ok(_) => DetectResult::Never,
                Err(e) => DetectResult::from_peek_error(&e),
            };
        }
    }

    DetectResult::Never
}
