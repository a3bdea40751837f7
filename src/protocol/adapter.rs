use crate::config::ProvidersConfig;
use crate::error::{error_envelope, Error, Result};
use crate::models::{ProviderKind, TokenUsage};
use crate::protocol::openai::{ChatRequest, ChatResponse, Choice, MessageContent, ResponseMessage};
use crate::protocol::{anthropic, openai, ProviderAdapter, TranslatedResponse};
use crate::relay::decoder::{AnthropicDecoder, OpenAIDecoder, StreamDecoder};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";

/// 短名 -> 带版本号的 Anthropic 模型标识
/// 已带版本号的标识也作为键，保证映射幂等
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-3-opus", "claude-3-opus-20240229"),
    ("claude-3-sonnet", "claude-3-sonnet-20240229"),
    ("claude-3-haiku", "claude-3-haiku-20240307"),
    ("claude-3.5-sonnet", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-sonnet", "claude-3-5-sonnet-20241022"),
    ("claude-3-opus-20240229", "claude-3-opus-20240229"),
    ("claude-3-sonnet-20240229", "claude-3-sonnet-20240229"),
    ("claude-3-haiku-20240307", "claude-3-haiku-20240307"),
    ("claude-3-5-sonnet-20241022", "claude-3-5-sonnet-20241022"),
];

/// 查别名表；未知模型名不报错，静默回落到 `fallback`
pub fn map_model_name<'a>(model: &str, fallback: &'a str) -> &'a str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, versioned)| *versioned)
        .unwrap_or(fallback)
}

/// Anthropic stop_reason -> 规范 finish_reason
pub fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => "stop".to_string(),
        Some("max_tokens") => "length".to_string(),
        Some("tool_use") => "tool_calls".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// 非结构化错误体统一包装为 server_error
fn wrap_unstructured(status: u16, body: &Bytes) -> Error {
    let text = String::from_utf8_lossy(body);
    let message = if text.trim().is_empty() {
        format!("Upstream returned status {}", status)
    } else {
        text.trim().to_string()
    };
    Error::UpstreamProvider {
        status,
        body: Bytes::from(error_envelope(&message, "server_error", "upstream_error").to_string()),
    }
}

// ================== OpenAI 兼容供应商 ==================

/// 规范格式本身就是 OpenAI 格式，请求和响应都只做透传
#[derive(Debug, Default, Clone)]
pub struct OpenAIAdapter;

impl ProviderAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn build_request(&self, _request: &ChatRequest, raw_body: &Bytes) -> Result<Bytes> {
        Ok(raw_body.clone())
    }

    fn translate_response(&self, body: Bytes, _caller_model: &str) -> Result<TranslatedResponse> {
        // 只读取 usage 用于计量，响应体原样返回
        let usage = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| serde_json::from_value::<openai::Usage>(v.get("usage")?.clone()).ok())
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        Ok(TranslatedResponse { body, usage })
    }

    fn translate_error(&self, status: u16, body: Bytes) -> Error {
        if serde_json::from_slice::<Value>(&body).is_ok() {
            Error::UpstreamProvider { status, body }
        } else {
            wrap_unstructured(status, &body)
        }
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAIDecoder::default())
    }
}

// ================== Anthropic 供应商 ==================

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    default_model: String,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AnthropicAdapter {
    pub fn new(default_model: Option<String>) -> Self {
        Self {
            default_model: default_model.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
        }
    }

    pub fn resolve_model(&self, model: &str) -> String {
        map_model_name(model, &self.default_model).to_string()
    }

    /// 第一条 system 消息提取为 system 字段，其余 system 消息丢弃；
    /// 非 assistant 角色一律映射为 user
    pub fn to_native(&self, request: &ChatRequest) -> anthropic::AnthropicRequest {
        let system = request
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.text());

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| anthropic::Message {
                role: if m.role == "assistant" {
                    "assistant".to_string()
                } else {
                    "user".to_string()
                },
                content: match &m.content {
                    MessageContent::Text(text) => Value::String(text.clone()),
                    MessageContent::Parts(parts) => Value::Array(parts.clone()),
                    MessageContent::Null => Value::String(String::new()),
                },
            })
            .collect();

        anthropic::AnthropicRequest {
            model: self.resolve_model(&request.model),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            stream: request.is_stream(),
        }
    }

    pub fn to_canonical(
        &self,
        response: &anthropic::AnthropicResponse,
        caller_model: &str,
    ) -> ChatResponse {
        let text = response
            .content
            .iter()
            .filter_map(|block| match block {
                anthropic::ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens);

        ChatResponse {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: caller_model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: text,
                },
                finish_reason: Some(map_stop_reason(response.stop_reason.as_deref())),
            }],
            usage: openai::Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens(),
            },
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn build_request(&self, request: &ChatRequest, _raw_body: &Bytes) -> Result<Bytes> {
        let native = self.to_native(request);
        debug!(
            "Anthropic request: model {} -> {}, {} messages",
            request.model,
            native.model,
            native.messages.len()
        );
        Ok(Bytes::from(serde_json::to_vec(&native)?))
    }

    fn translate_response(&self, body: Bytes, caller_model: &str) -> Result<TranslatedResponse> {
        let native: anthropic::AnthropicResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Translation(format!("Invalid Anthropic response: {}", e)))?;
        let canonical = self.to_canonical(&native, caller_model);
        let usage = TokenUsage::new(
            canonical.usage.prompt_tokens,
            canonical.usage.completion_tokens,
        );

        Ok(TranslatedResponse {
            body: Bytes::from(serde_json::to_vec(&canonical)?),
            usage: Some(usage),
        })
    }

    fn translate_error(&self, status: u16, body: Bytes) -> Error {
        match serde_json::from_slice::<anthropic::ErrorResponse>(&body) {
            Ok(native) => {
                let message = native
                    .error
                    .message
                    .unwrap_or_else(|| "Anthropic API error".to_string());
                let code = native.error.error_type.unwrap_or_else(|| "unknown".to_string());
                Error::UpstreamProvider {
                    status,
                    body: Bytes::from(error_envelope(&message, "api_error", &code).to_string()),
                }
            }
            Err(_) if serde_json::from_slice::<Value>(&body).is_ok() => {
                Error::UpstreamProvider { status, body }
            }
            Err(_) => wrap_unstructured(status, &body),
        }
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicDecoder::default())
    }
}

/// 按供应商类型选择适配器
#[derive(Debug, Clone)]
pub struct Adapters {
    openai: OpenAIAdapter,
    anthropic: AnthropicAdapter,
}

impl Adapters {
    pub fn new(config: &ProvidersConfig) -> Self {
        Self {
            openai: OpenAIAdapter,
            anthropic: AnthropicAdapter::new(config.anthropic.default_model.clone()),
        }
    }

    pub fn get(&self, kind: ProviderKind) -> &dyn ProviderAdapter {
        match kind {
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_message_is_extracted_and_defaults_applied() {
        let req = request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "S"},
                {"role": "user", "content": "hi"}
            ],
            "stream": false
        }));

        let body = AnthropicAdapter::default()
            .build_request(&req, &Bytes::new())
            .unwrap();
        let native: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(native["system"], "S");
        assert_eq!(native["messages"], json!([{"role": "user", "content": "hi"}]));
        assert_eq!(native["max_tokens"], 4096);
        assert_eq!(native["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(native["stream"], false);
        assert!(native.get("temperature").is_none());
    }

    #[test]
    fn temperature_and_max_tokens_pass_through() {
        let req = request(json!({
            "model": "claude-3-haiku",
            "messages": [{"role": "assistant", "content": "a"}, {"role": "tool", "content": "t"}],
            "temperature": 0.5,
            "max_tokens": 100
        }));
        let native = AnthropicAdapter::default().to_native(&req);

        assert_eq!(native.temperature, Some(0.5));
        assert_eq!(native.max_tokens, 100);
        assert_eq!(native.system, None);
        assert_eq!(native.messages[0].role, "assistant");
        assert_eq!(native.messages[1].role, "user");
    }

    #[test]
    fn only_first_system_message_becomes_system_field() {
        let req = request(json!({
            "model": "claude-3-opus",
            "messages": [
                {"role": "system", "content": "first"},
                {"role": "user", "content": "q"},
                {"role": "system", "content": "second"}
            ]
        }));
        let native = AnthropicAdapter::default().to_native(&req);
        assert_eq!(native.system.as_deref(), Some("first"));
        assert_eq!(native.messages.len(), 1);
    }

    #[test]
    fn unknown_alias_falls_back_to_default_model() {
        assert_eq!(
            map_model_name("claude-99-ultra", DEFAULT_ANTHROPIC_MODEL),
            DEFAULT_ANTHROPIC_MODEL
        );
        let adapter = AnthropicAdapter::new(Some("claude-3-haiku-20240307".into()));
        assert_eq!(adapter.resolve_model("nope"), "claude-3-haiku-20240307");
    }

    #[test]
    fn alias_mapping_is_idempotent() {
        for (_, versioned) in MODEL_ALIASES {
            let once = map_model_name(versioned, DEFAULT_ANTHROPIC_MODEL);
            assert_eq!(once, *versioned);
            assert_eq!(map_model_name(once, DEFAULT_ANTHROPIC_MODEL), once);
        }
    }

    #[test]
    fn anthropic_response_is_translated_with_summed_usage() {
        let body = Bytes::from(
            json!({
                "id": "msg_01",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello"}],
                "model": "claude-3-5-sonnet-20241022",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 30}
            })
            .to_string(),
        );

        let translated = AnthropicAdapter::default()
            .translate_response(body, "claude-3-5-sonnet")
            .unwrap();
        let v: Value = serde_json::from_slice(&translated.body).unwrap();

        assert!(v["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "claude-3-5-sonnet");
        assert_eq!(v["choices"][0]["message"]["content"], "Hello");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["usage"]["prompt_tokens"], 12);
        assert_eq!(v["usage"]["completion_tokens"], 30);
        assert_eq!(v["usage"]["total_tokens"], 42);
        assert_eq!(translated.usage, Some(TokenUsage::new(12, 30)));
    }

    #[test]
    fn stop_reasons_are_mapped() {
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("tool_use")), "tool_calls");
        assert_eq!(map_stop_reason(Some("stop_sequence")), "stop");
        assert_eq!(map_stop_reason(None), "stop");
        assert_eq!(map_stop_reason(Some("refusal")), "refusal");
    }

    #[test]
    fn openai_response_is_returned_verbatim_with_usage() {
        let raw = json!({
            "id": "chatcmpl-x",
            "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7},
            "system_fingerprint": "fp"
        })
        .to_string();
        let translated = OpenAIAdapter
            .translate_response(Bytes::from(raw.clone()), "gpt-4")
            .unwrap();
        assert_eq!(translated.body, Bytes::from(raw));
        assert_eq!(translated.usage, Some(TokenUsage::new(3, 4)));
    }

    #[test]
    fn openai_request_keeps_unknown_fields() {
        let raw = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "top_p": 0.9,
            "stream_options": {"include_usage": true}
        });
        let body = OpenAIAdapter
            .build_request(&request(raw.clone()), &Bytes::from(raw.to_string()))
            .unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["top_p"], 0.9);
        assert_eq!(v["stream_options"]["include_usage"], true);
    }

    fn tool_conversation() -> Value {
        json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "name": "alice", "content": "hi"},
                {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{}"}
                    }]
                },
                {"role": "tool", "tool_call_id": "call_1", "content": "42"}
            ]
        })
    }

    #[test]
    fn openai_request_forwards_caller_body_unchanged() {
        let raw = Bytes::from(tool_conversation().to_string());
        let req: ChatRequest = serde_json::from_slice(&raw).unwrap();

        let body = OpenAIAdapter.build_request(&req, &raw).unwrap();
        assert_eq!(body, raw);
    }

    #[test]
    fn per_message_fields_survive_reserialization() {
        let req = request(tool_conversation());
        let v = serde_json::to_value(&req).unwrap();

        assert_eq!(v["messages"][0]["name"], "alice");
        assert_eq!(v["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(v["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(v["messages"][2]["content"], "42");
    }

    #[test]
    fn structured_openai_error_passes_through_unchanged() {
        let body = Bytes::from_static(br#"{"error":{"message":"Rate limit","type":"requests"}}"#);
        match OpenAIAdapter.translate_error(429, body.clone()) {
            Error::UpstreamProvider { status, body: out } => {
                assert_eq!(status, 429);
                assert_eq!(out, body);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn anthropic_error_is_normalized_to_envelope() {
        let body = Bytes::from_static(
            br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        match AnthropicAdapter::default().translate_error(529, body) {
            Error::UpstreamProvider { status, body } => {
                assert_eq!(status, 529);
                let v: Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(v["error"]["message"], "Overloaded");
                assert_eq!(v["error"]["type"], "api_error");
                assert_eq!(v["error"]["code"], "overloaded_error");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unstructured_error_is_wrapped_as_server_error() {
        match OpenAIAdapter.translate_error(502, Bytes::from_static(b"<html>Bad Gateway</html>")) {
            Error::UpstreamProvider { status, body } => {
                assert_eq!(status, 502);
                let v: Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(v["error"]["type"], "server_error");
                assert_eq!(v["error"]["message"], "<html>Bad Gateway</html>");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
