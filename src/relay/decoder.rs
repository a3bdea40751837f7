//! 供应商特定的流式事件解码
//!
//! 引擎负责行组装、`[DONE]` 识别和 JSON 解析，解码器只看已解析的 `data:` 负载。

use crate::models::TokenUsage;
use crate::protocol::adapter::map_stop_reason;
use crate::relay::StreamEvent;
use serde_json::Value;
use tracing::debug;

/// 单条 `data:` 负载的解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// 翻译为规范事件
    Event(StreamEvent),
    /// 已经是规范格式（或无法识别），转发这一行
    Passthrough,
    /// 对调用方不可见的供应商内部事件
    Ignore,
}

pub trait StreamDecoder: Send {
    fn decode(&mut self, payload: &Value) -> Decoded;

    /// 已经观察到但尚未发出的结束原因（遇到 `[DONE]` 或连接关闭时使用）
    fn stop_reason(&self) -> Option<String>;

    /// 上游报告的 token 数，自上次调用后有更新时返回
    fn take_usage(&mut self) -> Option<TokenUsage>;
}

fn error_event(error: &Value) -> StreamEvent {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Upstream stream error")
        .to_string();
    let code = error
        .get("type")
        .or_else(|| error.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("upstream_error")
        .to_string();
    StreamEvent::Error { message, code }
}

#[derive(Debug, Default)]
struct UsageTracker {
    usage: TokenUsage,
    dirty: bool,
}

impl UsageTracker {
    fn prompt(&mut self, tokens: Option<u64>) {
        if let Some(tokens) = tokens {
            self.usage.prompt_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
            self.dirty = true;
        }
    }

    fn completion(&mut self, tokens: Option<u64>) {
        if let Some(tokens) = tokens {
            self.usage.completion_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
            self.dirty = true;
        }
    }

    fn take(&mut self) -> Option<TokenUsage> {
        if self.dirty {
            self.dirty = false;
            Some(self.usage)
        } else {
            None
        }
    }
}

// ================== OpenAI ==================

/// OpenAI chunk 格式:
/// ```text
/// data: {"id":"chatcmpl-123","choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null}]}
/// data: {"id":"chatcmpl-123","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}
/// data: {"id":"chatcmpl-123","choices":[{"delta":{},"finish_reason":"stop"}]}
/// data: {"id":"chatcmpl-123","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}
/// data: [DONE]
/// ```
/// 结束信号是 `[DONE]`，finish_reason 先暂存，等到 `[DONE]` 时随完成事件一起发出。
#[derive(Debug, Default)]
pub struct OpenAIDecoder {
    finish_reason: Option<String>,
    usage: UsageTracker,
}

impl StreamDecoder for OpenAIDecoder {
    fn decode(&mut self, payload: &Value) -> Decoded {
        if let Some(error) = payload.get("error") {
            return Decoded::Event(error_event(error));
        }

        if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
            self.usage
                .prompt(usage.get("prompt_tokens").and_then(Value::as_u64));
            self.usage
                .completion(usage.get("completion_tokens").and_then(Value::as_u64));
        }

        let choice = match payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            Some(choice) => choice,
            None => return Decoded::Passthrough,
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        match choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => Decoded::Event(StreamEvent::ContentDelta {
                text: text.to_string(),
            }),
            _ if choice.get("finish_reason").map_or(false, |r| !r.is_null()) => {
                // 单独的 finish chunk 在完成事件中重新生成
                Decoded::Ignore
            }
            _ => Decoded::Passthrough,
        }
    }

    fn stop_reason(&self) -> Option<String> {
        self.finish_reason.clone()
    }

    fn take_usage(&mut self) -> Option<TokenUsage> {
        self.usage.take()
    }
}

// ================== Anthropic ==================

/// Anthropic 输入格式:
/// ```text
/// event: message_start
/// data: {"type":"message_start","message":{"usage":{"input_tokens":10}}}
///
/// event: content_block_delta
/// data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}
///
/// event: message_delta
/// data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}
///
/// event: message_stop
/// data: {"type":"message_stop"}
/// ```
/// `event:` 行被忽略，事件类型取自 JSON 的 `type` 字段。
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    stop_reason: Option<String>,
    usage: UsageTracker,
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, payload: &Value) -> Decoded {
        let event_type = payload.get("type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "content_block_delta" => {
                match payload
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                {
                    Some(text) if !text.is_empty() => Decoded::Event(StreamEvent::ContentDelta {
                        text: text.to_string(),
                    }),
                    _ => Decoded::Ignore,
                }
            }
            "message_start" => {
                self.usage.prompt(
                    payload
                        .pointer("/message/usage/input_tokens")
                        .and_then(Value::as_u64),
                );
                Decoded::Ignore
            }
            "message_delta" => {
                if let Some(reason) = payload.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                self.usage.completion(
                    payload
                        .pointer("/usage/output_tokens")
                        .and_then(Value::as_u64),
                );
                Decoded::Ignore
            }
            "message_stop" => Decoded::Event(StreamEvent::Completion {
                reason: map_stop_reason(self.stop_reason.as_deref()),
            }),
            "error" => Decoded::Event(error_event(payload.get("error").unwrap_or(payload))),
            other => {
                debug!("Ignoring Anthropic event type: {}", other);
                Decoded::Ignore
            }
        }
    }

    fn stop_reason(&self) -> Option<String> {
        self.stop_reason
            .as_deref()
            .map(|r| map_stop_reason(Some(r)))
    }

    fn take_usage(&mut self) -> Option<TokenUsage> {
        self.usage.take()
    }
}
