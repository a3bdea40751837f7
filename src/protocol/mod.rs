pub mod adapter;
pub mod anthropic;
pub mod openai;
pub mod sse;

use crate::error::{Error, Result};
use crate::models::{ProviderKind, TokenUsage};
use crate::protocol::openai::ChatRequest;
use crate::relay::decoder::StreamDecoder;
use bytes::Bytes;

/// 翻译后的非流式响应
#[derive(Debug, Clone)]
pub struct TranslatedResponse {
    /// 返回给调用方的规范格式响应体
    pub body: Bytes,
    /// 供计量使用的 token 数，上游未提供时为 `None`
    pub usage: Option<TokenUsage>,
}

/// 规范格式与某个上游供应商原生格式之间的双向映射
///
/// 所有方法都是纯函数，不做任何 I/O。
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// 规范请求 -> 上游原生请求体
    ///
    /// `raw_body` 是调用方发来的原始请求体，无需翻译的供应商直接转发它。
    fn build_request(&self, request: &ChatRequest, raw_body: &Bytes) -> Result<Bytes>;

    /// 上游原生响应 -> 规范响应，`caller_model` 原样回显给调用方
    fn translate_response(&self, body: Bytes, caller_model: &str) -> Result<TranslatedResponse>;

    /// 上游非 2xx 响应 -> 对调用方可见的错误
    fn translate_error(&self, status: u16, body: Bytes) -> Error;

    /// 为一次流式请求创建新的事件解码器
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}
