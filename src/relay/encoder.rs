//! 规范帧 -> 调用方可见的 SSE 字节

use crate::error::{error_envelope, Result};
use crate::protocol::adapter::completion_id;
use crate::protocol::openai::{ChatChunk, ChunkChoice, ChunkDelta};
use crate::protocol::sse::{data_payload, done_frame, format_sse};
use crate::relay::{RelayFrame, StreamEvent};
use crate::usage_collector::StreamUsageCollector;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::warn;

/// 为一个流生成规范 chunk，整条流共用同一个 id 和 created
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    id: String,
    model: String,
    created: i64,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    fn data(&self, chunk: &ChatChunk) -> Option<String> {
        match serde_json::to_string(chunk) {
            Ok(json) => Some(format_sse(&json)),
            Err(e) => {
                warn!("Failed to serialize stream chunk: {}", e);
                None
            }
        }
    }

    /// 透传的 chunk 改用本流的 id 和调用方的模型名，其它行原样转发
    fn passthrough(&self, line: &str) -> String {
        let mut chunk = match data_payload(line).and_then(|p| serde_json::from_str::<Value>(p).ok()) {
            Some(Value::Object(chunk)) if chunk.contains_key("choices") => chunk,
            _ => return format!("{}\n\n", line),
        };
        chunk.insert("id".to_string(), Value::String(self.id.clone()));
        chunk.insert("model".to_string(), Value::String(self.model.clone()));
        format_sse(&Value::Object(chunk).to_string())
    }

    /// 编码一帧；`Usage` 帧只供计量使用，返回 `None`
    pub fn encode(&self, frame: &RelayFrame) -> Option<Bytes> {
        match frame {
            RelayFrame::Event(StreamEvent::ContentDelta { text }) => {
                let chunk = self.chunk(
                    ChunkDelta {
                        role: None,
                        content: Some(text.clone()),
                    },
                    None,
                );
                self.data(&chunk).map(Bytes::from)
            }
            RelayFrame::Event(StreamEvent::Completion { reason }) => {
                let chunk = self.chunk(ChunkDelta::default(), Some(reason.clone()));
                let mut out = BytesMut::new();
                if let Some(data) = self.data(&chunk) {
                    out.extend_from_slice(data.as_bytes());
                }
                out.extend_from_slice(&done_frame());
                Some(out.freeze())
            }
            // 错误事件之后没有 [DONE]
            RelayFrame::Event(StreamEvent::Error { message, code }) => {
                let envelope = error_envelope(message, "stream_error", code);
                Some(Bytes::from(format_sse(&envelope.to_string())))
            }
            RelayFrame::Passthrough(line) => Some(Bytes::from(self.passthrough(line))),
            RelayFrame::Usage(_) => None,
        }
    }
}

/// 把帧流编码为响应体，同时把每一帧交给用量收集器
///
/// 收集器随响应体一起被丢弃；调用方提前断开时由它记录 499。
pub fn encode_stream<S>(
    frames: S,
    encoder: ChunkEncoder,
    mut collector: StreamUsageCollector,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static
where
    S: Stream<Item = RelayFrame> + Send + 'static,
{
    frames.filter_map(move |frame| {
        collector.observe(&frame);
        futures::future::ready(encoder.encode(&frame).map(Ok))
    })
}
