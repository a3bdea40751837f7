//! 流式中继引擎
//!
//! 每个流式请求对应一条上游连接。上游字节块先经过行组装，
//! 每条完整的 `data:` 行交给供应商解码器翻译为规范事件，按行的完成顺序立即转发。
//! 状态机：`Open -> Streaming -> {Completed | Failed}`，每个流恰好产生一个终止事件。

pub mod decoder;
pub mod encoder;

use crate::error::Result;
use crate::models::TokenUsage;
use crate::protocol::sse::{self, LineBuffer, DONE_SENTINEL};
use bytes::Bytes;
use decoder::{Decoded, StreamDecoder};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// 规范流式事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ContentDelta { text: String },
    Completion { reason: String },
    Error { message: String, code: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::ContentDelta { .. })
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            code: "upstream_transport_error".to_string(),
        }
    }

    pub fn translation_error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            code: "translation_error".to_string(),
        }
    }
}

/// 引擎输出的帧
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event(StreamEvent),
    /// 无法解析或已是规范格式的上游行，原样转发
    Passthrough(String),
    /// 上游报告的 token 数，只给计量使用，不会写给调用方
    Usage(TokenUsage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// 相邻两个上游数据块之间允许的最长等待
    pub idle_timeout: Duration,
    /// 未完成行的最大字节数
    pub max_line_bytes: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// 处理一条完整的行，返回终止后的状态（若这一行终止了流）
fn process_line(
    decoder: &mut dyn StreamDecoder,
    line: &str,
    out: &mut Vec<RelayFrame>,
) -> Option<RelayState> {
    // event: 行、注释行和空行不携带数据
    let payload = sse::data_payload(line)?;
    if payload.trim().is_empty() {
        return None;
    }

    if payload.trim() == DONE_SENTINEL {
        let reason = decoder.stop_reason().unwrap_or_else(|| "stop".to_string());
        out.push(RelayFrame::Event(StreamEvent::Completion { reason }));
        return Some(RelayState::Completed);
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("Forwarding unparseable upstream line verbatim: {}", e);
            out.push(RelayFrame::Passthrough(line.to_string()));
            return None;
        }
    };

    let decoded = decoder.decode(&value);
    if let Some(usage) = decoder.take_usage() {
        out.push(RelayFrame::Usage(usage));
    }

    match decoded {
        Decoded::Event(event) => {
            let state = match &event {
                StreamEvent::ContentDelta { .. } => None,
                StreamEvent::Completion { .. } => Some(RelayState::Completed),
                StreamEvent::Error { .. } => Some(RelayState::Failed),
            };
            out.push(RelayFrame::Event(event));
            state
        }
        Decoded::Passthrough => {
            out.push(RelayFrame::Passthrough(line.to_string()));
            None
        }
        Decoded::Ignore => None,
    }
}

/// 把上游字节流翻译为规范帧流
///
/// 返回的流是惰性的、有限的、不可重启的；丢弃它会同时丢弃上游连接。
pub fn relay<S>(
    request_id: String,
    upstream: S,
    mut decoder: Box<dyn StreamDecoder>,
    options: RelayOptions,
) -> impl Stream<Item = RelayFrame> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut lines = LineBuffer::new();
        let mut state = RelayState::Open;
        let mut frames = Vec::new();

        loop {
            let next = match tokio::time::timeout(options.idle_timeout, upstream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("[{}] Upstream idle for {:?}, closing stream", request_id, options.idle_timeout);
                    state = RelayState::Failed;
                    yield RelayFrame::Event(StreamEvent::transport_error(format!(
                        "Upstream sent no data for {}s",
                        options.idle_timeout.as_secs()
                    )));
                    break;
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    if state == RelayState::Open {
                        debug!("[{}] Relay state: Open -> Streaming", request_id);
                        state = RelayState::Streaming;
                    }

                    lines.push(&chunk);
                    let mut terminal = None;
                    while let Some(line) = lines.next_line() {
                        terminal = process_line(decoder.as_mut(), &line, &mut frames);
                        if terminal.is_some() {
                            break;
                        }
                    }

                    for frame in std::mem::take(&mut frames) {
                        yield frame;
                    }

                    if let Some(end) = terminal {
                        state = end;
                        break;
                    }

                    if lines.pending() > options.max_line_bytes {
                        warn!("[{}] Upstream line exceeds {} bytes without a newline", request_id, options.max_line_bytes);
                        state = RelayState::Failed;
                        yield RelayFrame::Event(StreamEvent::translation_error(
                            "Malformed upstream stream: line too long",
                        ));
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("[{}] Upstream stream error: {}", request_id, e);
                    state = RelayState::Failed;
                    yield RelayFrame::Event(StreamEvent::transport_error(e.to_string()));
                    break;
                }
                None => {
                    let mut terminal = None;
                    if let Some(line) = lines.take_remainder() {
                        terminal = process_line(decoder.as_mut(), &line, &mut frames);
                    }
                    for frame in std::mem::take(&mut frames) {
                        yield frame;
                    }

                    state = match terminal {
                        Some(end) => end,
                        None => match decoder.stop_reason() {
                            // 已经看到结束原因，只是缺少结束标记
                            Some(reason) => {
                                yield RelayFrame::Event(StreamEvent::Completion { reason });
                                RelayState::Completed
                            }
                            None => {
                                warn!("[{}] Upstream closed the stream without a terminal event", request_id);
                                yield RelayFrame::Event(StreamEvent::transport_error(
                                    "Upstream closed the stream before completion",
                                ));
                                RelayState::Failed
                            }
                        },
                    };
                    break;
                }
            }
        }

        debug!("[{}] Relay finished in state {:?}", request_id, state);
    }
}

/// 建立上游连接失败时使用：只包含一个错误事件的流
pub fn failed(message: impl Into<String>) -> impl Stream<Item = RelayFrame> + Send + 'static {
    futures::stream::iter(vec![RelayFrame::Event(StreamEvent::transport_error(message))])
}
