use crate::config::CatalogConfig;
use crate::models::ModelEntry;
use crate::proxy::ProxyForwarder;
use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, warn};

const CACHE_KEY: &str = "models";

/// 上游模型列表不可用时返回的默认目录
pub fn fallback_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry::new("gpt-4", "openai", 1687882410),
        ModelEntry::new("gpt-3.5-turbo", "openai", 1677610602),
    ]
}

/// 调用方可见的模型目录
///
/// 上游列表按 `allowed_models` 过滤后追加静态配置的模型。
/// 拉取失败时返回默认目录而不是报错，默认目录不进缓存。
pub struct ModelCatalog {
    proxy: Arc<ProxyForwarder>,
    allowed: Vec<String>,
    extras: Vec<ModelEntry>,
    cache: Cache<&'static str, Arc<Vec<ModelEntry>>>,
}

impl ModelCatalog {
    pub fn new(proxy: Arc<ProxyForwarder>, config: &CatalogConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(16)
            .time_to_live(config.cache_ttl)
            .build();

        Self {
            proxy,
            allowed: config.allowed_models.clone(),
            extras: config
                .extra_models
                .iter()
                .map(|m| ModelEntry::new(m.id.clone(), m.owned_by.clone(), m.created))
                .collect(),
            cache,
        }
    }

    pub async fn list(&self) -> Vec<ModelEntry> {
        if let Some(cached) = self.cache.get(CACHE_KEY).await {
            debug!("Model catalog served from cache");
            return cached.as_ref().clone();
        }

        match self.proxy.fetch_models().await {
            Ok(upstream) => {
                let merged = self.merge(upstream);
                self.cache
                    .insert(CACHE_KEY, Arc::new(merged.clone()))
                    .await;
                merged
            }
            Err(e) => {
                warn!("Failed to fetch upstream models, using fallback list: {}", e);
                fallback_models()
            }
        }
    }

    /// 过滤上游列表并追加静态模型；`allowed` 为空时不过滤
    pub fn merge(&self, upstream: Vec<ModelEntry>) -> Vec<ModelEntry> {
        let mut merged: Vec<ModelEntry> = upstream
            .into_iter()
            .filter(|m| {
                self.allowed.is_empty() || self.allowed.iter().any(|a| m.id.contains(a.as_str()))
            })
            .collect();

        for extra in &self.extras {
            if !merged.iter().any(|m| m.id == extra.id) {
                merged.push(extra.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog(base_url: &str) -> ModelCatalog {
        let mut config = Config::default();
        config.providers.openai.base_url = base_url.to_string();
        let proxy = Arc::new(ProxyForwarder::new(&config.proxy, config.providers.clone()).unwrap());
        ModelCatalog::new(proxy, &config.catalog)
    }

    fn ids(models: &[ModelEntry]) -> Vec<&str> {
        models.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn merge_filters_and_appends_extras() {
        let catalog = catalog("http://127.0.0.1:9");
        let merged = catalog.merge(vec![
            ModelEntry::new("gpt-4-0613", "openai", 1),
            ModelEntry::new("dall-e-3", "openai", 2),
            ModelEntry::new("gpt-3.5-turbo", "openai", 3),
        ]);

        let ids = ids(&merged);
        assert_eq!(&ids[..2], &["gpt-4-0613", "gpt-3.5-turbo"]);
        assert!(!ids.contains(&"dall-e-3"));
        assert!(ids.contains(&"claude-3-5-sonnet"));
        assert!(merged
            .iter()
            .filter(|m| m.id.starts_with("claude"))
            .all(|m| m.owned_by == "anthropic"));
    }

    #[tokio::test]
    async fn upstream_failure_falls_back() {
        let catalog = catalog("http://127.0.0.1:9");
        assert_eq!(catalog.list().await, fallback_models());
    }

    #[tokio::test]
    async fn successful_list_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "gpt-4", "created": 1687882410, "owned_by": "openai"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = catalog(&server.uri());
        let first = catalog.list().await;
        let second = catalog.list().await;
        assert_eq!(first, second);
        assert_eq!(first[0].id, "gpt-4");
    }
}
