use crate::config::{ProviderConfig, ProvidersConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::models::{ModelEntry, ProviderKind};
use crate::protocol::ProviderAdapter;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Response,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// 上游字节流
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Deserialize)]
struct UpstreamModelList {
    #[serde(default)]
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModel {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    owned_by: String,
}

/// 与上游供应商通信的唯一出口
pub struct ProxyForwarder {
    client: Client,
    // 流式专用，不设整体超时，空闲超时由中继引擎负责
    streaming_client: Client,
    providers: ProvidersConfig,
    idle_timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(config: &ProxyConfig, providers: ProvidersConfig) -> Result<Self> {
        let keep_alive = if config.keep_alive {
            Some(Duration::from_secs(30))
        } else {
            None
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(keep_alive)
            .build()
            .map_err(Error::Http)?;

        let streaming_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(keep_alive)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            streaming_client,
            providers,
            idle_timeout: config.idle_timeout,
        })
    }

    fn provider(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::OpenAI => &self.providers.openai,
            ProviderKind::Anthropic => &self.providers.anthropic,
        }
    }

    /// 拼接上游地址，base_url 带不带 `/v1` 都可以
    pub fn endpoint(base_url: &str, path: &str) -> String {
        let base_url = base_url.trim_end_matches('/');
        if base_url.ends_with("/v1") {
            format!("{}{}", base_url, path)
        } else {
            format!("{}/v1{}", base_url, path)
        }
    }

    fn completion_url(&self, kind: ProviderKind) -> String {
        let path = match kind {
            ProviderKind::OpenAI => "/chat/completions",
            ProviderKind::Anthropic => "/messages",
        };
        Self::endpoint(&self.provider(kind).base_url, path)
    }

    /// 按供应商设置认证头
    fn headers(&self, kind: ProviderKind) -> Result<HeaderMap> {
        let provider = self.provider(kind);
        let mut headers = HeaderMap::new();

        match kind {
            ProviderKind::Anthropic => {
                headers.insert(
                    HeaderName::from_static("x-api-key"),
                    HeaderValue::from_str(&provider.api_key)
                        .map_err(|_| Error::Config("Invalid Anthropic API key format".into()))?,
                );
                let version = provider.version.as_deref().unwrap_or("2023-06-01");
                headers.insert(
                    HeaderName::from_static("anthropic-version"),
                    HeaderValue::from_str(version)
                        .map_err(|_| Error::Config("Invalid anthropic-version".into()))?,
                );
            }
            ProviderKind::OpenAI => {
                headers.insert(
                    HeaderName::from_static("authorization"),
                    HeaderValue::from_str(&format!("Bearer {}", provider.api_key))
                        .map_err(|_| Error::Config("Invalid OpenAI API key format".into()))?,
                );
            }
        }

        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    /// 非 2xx 响应读出 body 交给适配器翻译
    async fn error_from(adapter: &dyn ProviderAdapter, response: Response) -> Error {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        error!(
            "Upstream {} error response (status {}): {}",
            adapter.kind(),
            status,
            String::from_utf8_lossy(&body)
        );
        adapter.translate_error(status, body)
    }

    /// 非流式转发，返回上游成功响应的原始 body
    pub async fn forward(&self, adapter: &dyn ProviderAdapter, body: Bytes) -> Result<Bytes> {
        let kind = adapter.kind();
        let url = self.completion_url(kind);
        info!("forward: {} -> {}", kind, url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(kind)?)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::Http(e)
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from(adapter, response).await);
        }

        info!("Upstream success response status: {}", response.status());
        response.bytes().await.map_err(Error::Http)
    }

    /// 建立流式连接，握手同样受空闲超时约束
    pub async fn open_stream(&self, adapter: &dyn ProviderAdapter, body: Bytes) -> Result<ByteStream> {
        let kind = adapter.kind();
        let url = self.completion_url(kind);
        info!("stream: {} -> {}", kind, url);

        let request = self
            .streaming_client
            .post(&url)
            .headers(self.headers(kind)?)
            .body(body)
            .send();

        let response = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| {
                error!("Upstream did not respond within {:?}", self.idle_timeout);
                Error::UpstreamTransport(format!(
                    "Upstream did not respond within {}s",
                    self.idle_timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                error!("HTTP client connection failed (stream): {:?}", e);
                Error::Http(e)
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from(adapter, response).await);
        }

        info!("stream: established (status {})", response.status());
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::Http))
            .boxed())
    }

    /// 拉取 OpenAI 兼容供应商的模型列表
    pub async fn fetch_models(&self) -> Result<Vec<ModelEntry>> {
        let kind = ProviderKind::OpenAI;
        let url = Self::endpoint(&self.provider(kind).base_url, "/models");

        let response = self
            .client
            .get(&url)
            .headers(self.headers(kind)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamProvider {
                status: status.as_u16(),
                body: response.bytes().await.unwrap_or_default(),
            });
        }

        let list: UpstreamModelList = serde_json::from_slice(&response.bytes().await?)?;
        Ok(list
            .data
            .into_iter()
            .map(|m| {
                let owned_by = if m.owned_by.is_empty() {
                    kind.as_str().to_string()
                } else {
                    m.owned_by
                };
                ModelEntry::new(m.id, owned_by, m.created)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::adapter::{AnthropicAdapter, OpenAIAdapter};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder(openai: &str, anthropic: &str) -> ProxyForwarder {
        let mut config = Config::default();
        config.providers.openai.base_url = openai.to_string();
        config.providers.openai.api_key = "sk-upstream".to_string();
        config.providers.anthropic.base_url = anthropic.to_string();
        config.providers.anthropic.api_key = "ak-upstream".to_string();
        ProxyForwarder::new(&config.proxy, config.providers).unwrap()
    }

    #[test]
    fn endpoint_handles_v1_suffix() {
        assert_eq!(
            ProxyForwarder::endpoint("https://api.openai.com", "/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            ProxyForwarder::endpoint("https://gw.example.com/v1/", "/messages"),
            "https://gw.example.com/v1/messages"
        );
    }

    #[tokio::test]
    async fn openai_forward_uses_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-upstream"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = forwarder(&server.uri(), &server.uri());
        let body = proxy
            .forward(&OpenAIAdapter, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn anthropic_forward_uses_api_key_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-upstream"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = forwarder(&server.uri(), &server.uri());
        proxy
            .forward(&AnthropicAdapter::new(None), Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn provider_error_keeps_status_and_body() {
        let server = MockServer::start().await;
        let body = r#"{"error":{"message":"Rate limit","type":"rate_limit_error","code":"rate_limit"}}"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string(body))
            .mount(&server)
            .await;

        let proxy = forwarder(&server.uri(), &server.uri());
        let err = proxy
            .forward(&OpenAIAdapter, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        match err {
            Error::UpstreamProvider { status, body: got } => {
                assert_eq!(status, 429);
                assert_eq!(got, Bytes::from(body));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        let proxy = forwarder("http://127.0.0.1:9", "http://127.0.0.1:9");
        let err = proxy
            .forward(&OpenAIAdapter, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn open_stream_yields_upstream_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"type\":\"message_stop\"}\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let proxy = forwarder(&server.uri(), &server.uri());
        let stream = proxy
            .open_stream(&AnthropicAdapter::new(None), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"data: {\"type\":\"message_stop\"}\n\n".to_vec());
    }

    #[tokio::test]
    async fn fetch_models_parses_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [
                    {"id": "gpt-4", "object": "model", "created": 1687882410, "owned_by": "openai"},
                    {"id": "whisper-1", "object": "model", "created": 1677532384}
                ]
            })))
            .mount(&server)
            .await;

        let proxy = forwarder(&server.uri(), &server.uri());
        let models = proxy.fetch_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0], ModelEntry::new("gpt-4", "openai", 1687882410));
        assert_eq!(models[1].owned_by, "openai");
    }
}
