use bytes::{Bytes, BytesMut};

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// 生成 SSE 格式的字符串
pub fn format_sse(data: &str) -> String {
    format!("data: {}\n\n", data)
}

pub fn done_frame() -> Bytes {
    Bytes::from(format_sse(DONE_SENTINEL))
}

/// 取出 `data:` 行的内容，兼容冒号后有无空格
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// 行组装缓冲区
///
/// 上游数据块可能在任意字节处切开一行（甚至切开一个多字节字符），
/// 未以 `\n` 结尾的部分会保留到下一个数据块到来时再拼接。
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// 取出下一条完整的行（去掉 `\r\n` / `\n`）
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        let mut end = line.len() - 1;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// 尚未组成完整行的字节数
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// 连接关闭时取出最后一段没有换行符的数据
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}
