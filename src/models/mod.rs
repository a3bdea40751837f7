use crate::auth::{AuthContext, Identity};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// 上游供应商类型
/// 决定请求翻译方式、认证方式和流式事件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI 兼容协议，与规范格式一致，请求直接透传
    OpenAI,
    /// Anthropic Messages 协议
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次调用的请求上下文
/// 在认证通过后创建，之后只读，响应完成后丢弃
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 请求ID，贯穿日志和用量记录
    pub request_id: String,
    /// 调用方认证结果
    pub auth: AuthContext,
    /// 入站路径，例如 "/v1/chat/completions"
    pub endpoint: String,
    /// 调用方请求的原始模型名（响应中原样回显）
    pub model: String,
    /// 路由决定的上游供应商
    pub provider: ProviderKind,
    /// 是否为流式请求
    pub stream: bool,
    /// 原始请求体
    pub raw_body: Bytes,
    /// 请求开始时间，用于计算延迟
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(
        auth: AuthContext,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        provider: ProviderKind,
        stream: bool,
        raw_body: Bytes,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            auth,
            endpoint: endpoint.into(),
            model: model.into(),
            provider,
            stream,
            raw_body,
            started_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.auth.identity.as_ref()
    }
}

/// Token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// 一次请求结束时交给计量模块的摘要
#[derive(Debug, Clone, Default)]
pub struct UsageOutcome {
    pub usage: TokenUsage,
    /// completion_tokens 是否为估算值（流式按空白分词）
    pub estimated: bool,
    /// 返回给调用方的 HTTP 状态码
    pub status: u16,
    pub error: Option<String>,
}

/// 用量记录
/// 只追加，由计量模块独占；翻译路径从不读取
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// 请求ID（用于去重）
    pub request_id: String,
    /// 调用方 key 的脱敏提示
    pub key_hint: String,
    /// 完整 key 的摘要，按 key 汇总时使用
    pub key_id: String,
    /// 调用方身份，key 分段不足时为空
    pub identity: Option<Identity>,
    /// 调用的入站端点
    pub endpoint: String,
    /// 调用方请求的模型名称
    pub model: String,
    pub provider: ProviderKind,
    /// 输入Token数
    pub prompt_tokens: u32,
    /// 输出Token数
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// 输出Token数是否为估算
    pub estimated: bool,
    /// 估算成本
    pub cost: f64,
    /// 延迟（毫秒）
    pub latency_ms: u64,
    /// HTTP 状态码，调用方提前断开时为 499
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 模型目录条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    /// 模型家族 / 所属供应商
    pub owned_by: String,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.into(),
        }
    }
}
