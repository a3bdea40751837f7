use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 推理中继的主配置结构
/// 包含服务器、日志、认证、上游供应商、代理、模型目录和用量计量等各个模块的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    pub server: ServerConfig,
    /// 日志输出配置
    #[serde(default)]
    pub log: LogConfig,
    /// 调用方凭证配置
    pub auth: AuthConfig,
    /// 上游供应商配置
    pub providers: ProvidersConfig,
    /// 代理转发配置
    pub proxy: ProxyConfig,
    /// 模型目录配置
    pub catalog: CatalogConfig,
    /// 用量计量配置
    pub metering: MeteringConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为4000
    pub port: u16,
    /// 请求体最大字节数
    pub body_limit: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// 输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

/// 调用方凭证配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// 允许访问的调用方 key 列表
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// key 内部的分段分隔符，格式约定为 `<prefix>_<env>_<tenant>_<user>_<random>`
    pub delimiter: String,
}

/// 上游供应商配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvidersConfig {
    /// OpenAI 兼容供应商（默认路由目标）
    pub openai: ProviderConfig,
    /// Anthropic 供应商
    pub anthropic: ProviderConfig,
}

/// 单个上游供应商
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// 上游 API 的基础URL，例如 "https://api.openai.com"，可带或不带 `/v1`
    pub base_url: String,
    /// 上游 API 密钥
    #[serde(default)]
    pub api_key: String,
    /// `anthropic-version` 头的取值，仅 Anthropic 使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// 别名表未命中时使用的模型标识，仅 Anthropic 使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// 代理配置
/// 用于配置与上游LLM服务通信的相关参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// 非流式请求的整体超时时间
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 建立TCP连接的超时时间
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// 流式请求的空闲超时：等待握手或相邻两个数据块之间的最长时间
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// 每个上游主机保留的最大空闲连接数
    pub max_connections: usize,
    /// 是否启用TCP Keep-Alive
    pub keep_alive: bool,
    /// 未结束的单行SSE数据允许的最大字节数，超过视为上游数据损坏
    pub max_line_bytes: usize,
}

/// 模型目录配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// 上游模型列表的过滤条件：模型 id 包含其中任一字符串即保留
    pub allowed_models: Vec<String>,
    /// 上游不会列出、需要额外追加的模型
    pub extra_models: Vec<CatalogModel>,
    /// 合并后目录的缓存时间
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogModel {
    pub id: String,
    pub owned_by: String,
    pub created: i64,
}

/// 用量计量配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeteringConfig {
    /// 每记录多少次请求输出一次汇总统计
    pub report_every: usize,
    /// 每个 prompt token 的估算成本
    pub prompt_token_cost: f64,
    /// 每个 completion token 的估算成本
    pub completion_token_cost: f64,
    /// 内存中保留的最大记录数
    pub max_records: usize,
    /// 外部用量收集服务地址，设置后每条记录都会异步上报
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_url: Option<String>,
}

/// 兼容旧部署方式的扁平环境变量 -> 配置键
const LEGACY_ENV: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("OPENAI_API_KEY", "providers.openai.api_key"),
    ("OPENAI_BASE_URL", "providers.openai.base_url"),
    ("ANTHROPIC_API_KEY", "providers.anthropic.api_key"),
    ("ANTHROPIC_BASE_URL", "providers.anthropic.base_url"),
];

impl Config {
    /// 加载配置
    ///
    /// # 说明
    /// 1. 以 `Config::default()` 作为底层默认值
    /// 2. 叠加配置文件（文件不存在时跳过）
    /// 3. 从环境变量覆盖配置（前缀为RELAY，分隔符为__）
    ///    例如：RELAY__SERVER__PORT=8081 会覆盖 server.port
    /// 4. 最后应用扁平环境变量（PORT、OPENAI_API_KEY、RELAY_API_KEYS 等）
    pub fn load(path: &str) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// 与 `load` 相同，但环境变量通过 `lookup` 读取，便于测试
    pub fn load_with<F>(path: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut builder = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"));

        for (var, key) in LEGACY_ENV {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                builder = builder
                    .set_override(*key, value)
                    .map_err(|e| Error::Config(e.to_string()))?;
            }
        }

        if let Some(keys) = lookup("RELAY_API_KEYS") {
            builder = builder
                .set_override("auth.api_keys", parse_key_list(&keys))
                .map_err(|e| Error::Config(e.to_string()))?;
        }

        let settings = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// 创建默认配置
    ///
    /// # 默认值
    /// - 服务器：监听 0.0.0.0:4000，请求体上限10MB
    /// - 上游：api.openai.com / api.anthropic.com，密钥为空
    /// - 代理：非流式超时2分钟，空闲超时2分钟，最大500连接
    /// - 计量：每10次请求输出一次汇总
    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4000,
                body_limit: 10 * 1024 * 1024,
            },
            log: LogConfig::default(),
            auth: AuthConfig {
                api_keys: Vec::new(),
                delimiter: "_".to_string(),
            },
            providers: ProvidersConfig {
                openai: ProviderConfig {
                    base_url: "https://api.openai.com".to_string(),
                    api_key: String::new(),
                    version: None,
                    default_model: None,
                },
                anthropic: ProviderConfig {
                    base_url: "https://api.anthropic.com".to_string(),
                    api_key: String::new(),
                    version: Some("2023-06-01".to_string()),
                    default_model: None,
                },
            },
            proxy: ProxyConfig {
                timeout: Duration::from_secs(120),
                connect_timeout: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(120),
                max_connections: 500,
                keep_alive: true,
                max_line_bytes: 1024 * 1024,
            },
            catalog: CatalogConfig {
                allowed_models: vec![
                    "gpt-4".to_string(),
                    "gpt-4-turbo-preview".to_string(),
                    "gpt-3.5-turbo".to_string(),
                    "gpt-3.5-turbo-16k".to_string(),
                ],
                extra_models: default_extra_models(),
                cache_ttl: Duration::from_secs(300),
            },
            metering: MeteringConfig {
                report_every: 10,
                prompt_token_cost: 0.00003,
                completion_token_cost: 0.00006,
                max_records: 10_000,
                collector_url: None,
            },
        }
    }
}

fn default_extra_models() -> Vec<CatalogModel> {
    [
        ("claude-3-5-sonnet", 1729814400),
        ("claude-3-5-sonnet-20241022", 1729814400),
        ("claude-3-opus", 1708992000),
        ("claude-3-sonnet", 1708992000),
        ("claude-3-haiku", 1709856000),
    ]
    .into_iter()
    .map(|(id, created)| CatalogModel {
        id: id.to_string(),
        owned_by: "anthropic".to_string(),
        created,
    })
    .collect()
}

/// 解析逗号分隔的 key 列表，去掉空白和空项
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
