use crate::error::{Error, Result};
use crate::models::UsageRecord;
use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Duration;

/// 用量记录的外部去处
///
/// 计量写入任务为每条记录单独派发一次 `submit`，失败只记日志。
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn submit(&self, record: &UsageRecord) -> Result<()>;
}

/// 把每条记录 POST 给外部用量收集服务
pub struct HttpCollectorSink {
    client: Client,
    url: String,
}

impl HttpCollectorSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UsageSink for HttpCollectorSink {
    async fn submit(&self, record: &UsageRecord) -> Result<()> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamProvider {
                status: status.as_u16(),
                body: response.bytes().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> UsageRecord {
        UsageRecord {
            request_id: "req-1".into(),
            key_hint: "sk-a...wxyz".into(),
            key_id: "0123456789abcdef".into(),
            identity: None,
            endpoint: "/v1/chat/completions".into(),
            model: "gpt-4".into(),
            provider: ProviderKind::OpenAI,
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
            estimated: false,
            cost: 0.0,
            latency_ms: 12,
            status: 200,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn posts_record_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/usage"))
            .and(body_partial_json(serde_json::json!({
                "request_id": "req-1",
                "provider": "openai",
                "total_tokens": 7
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpCollectorSink::new(format!("{}/usage", server.uri())).unwrap();
        sink.submit(&record()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpCollectorSink::new(server.uri()).unwrap();
        let err = sink.submit(&record()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamProvider { status: 503, .. }));
    }
}
