use crate::config::AuthConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{info, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// 从 key 结构中解析出的调用方身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub tenant: String,
    pub user: String,
}

/// 认证通过后的调用方信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// 脱敏后的 key，仅用于日志
    pub key_hint: String,
    /// 完整 key 的摘要，用量按它归属；不同 key 的脱敏结果可能相同
    pub key_id: String,
    /// key 分段不足四段时为 `None`：已认证，但身份未知
    pub identity: Option<Identity>,
}

/// 校验入站 Bearer 凭证并推导调用方身份
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    allowed: HashSet<String>,
    delimiter: String,
}

impl CredentialResolver {
    pub fn new(config: &AuthConfig) -> Self {
        let allowed: HashSet<String> = config
            .api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        if allowed.is_empty() {
            warn!("No caller API keys configured, every request will be rejected");
        }

        Self {
            allowed,
            delimiter: config.delimiter.clone(),
        }
    }

    /// 校验 `Authorization` 头的原始值
    pub fn resolve(&self, header: Option<&str>) -> Result<AuthContext> {
        let token = header
            .and_then(|h| h.strip_prefix(BEARER_PREFIX))
            .ok_or_else(|| {
                warn!("Missing or invalid authorization header");
                Error::Unauthenticated("Missing or invalid authorization header".into())
            })?;

        let key_hint = mask_key(token);

        if !self.allowed.contains(token) {
            warn!("Invalid API key attempt: {}", key_hint);
            return Err(Error::Unauthenticated("Invalid API key".into()));
        }

        let identity = parse_identity(token, &self.delimiter);
        match &identity {
            Some(id) => info!(
                "Authenticated request: key={}, tenant={}, user={}",
                key_hint, id.tenant, id.user
            ),
            None => info!("Authenticated request: key={}, identity unknown", key_hint),
        }

        Ok(AuthContext {
            key_hint,
            key_id: fingerprint(token),
            identity,
        })
    }
}

/// 按分隔符切分 key：第3段为租户，第4段为用户
/// 例如 `lc_dev_team1_cursor_x8k9j2h4` -> tenant=team1, user=cursor
pub fn parse_identity(token: &str, delimiter: &str) -> Option<Identity> {
    if delimiter.is_empty() {
        return None;
    }
    let mut segments = token.split(delimiter).skip(2);
    let tenant = segments.next()?;
    let user = segments.next()?;
    Some(Identity {
        tenant: tenant.to_string(),
        user: user.to_string(),
    })
}

/// 日志中只展示 key 的首尾各4个字符
pub fn mask_key(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "***".to_string()
    }
}

/// SHA-256 摘要的前16个十六进制字符
pub fn fingerprint(token: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(token.as_bytes()));
    digest[..16].to_string()
}
