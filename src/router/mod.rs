use crate::models::ProviderKind;

/// 根据模型名选择上游供应商
///
/// 模型名包含 "claude"（不区分大小写）时走 Anthropic，其余一律走 OpenAI 兼容供应商，
/// 未知模型不报错。
pub fn resolve_provider(model: &str) -> ProviderKind {
    if model.to_ascii_lowercase().contains("claude") {
        ProviderKind::Anthropic
    } else {
        ProviderKind::OpenAI
    }
}
