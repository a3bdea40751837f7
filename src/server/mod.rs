pub mod handlers;

use crate::auth::CredentialResolver;
use crate::catalog::ModelCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::protocol::adapter::Adapters;
use crate::proxy::ProxyForwarder;
use crate::relay::RelayOptions;
use crate::telemetry::UsageMeter;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::Request,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// 所有请求共享的只读状态
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<CredentialResolver>,
    pub adapters: Arc<Adapters>,
    pub proxy: Arc<ProxyForwarder>,
    pub catalog: Arc<ModelCatalog>,
    pub meter: UsageMeter,
    pub relay_options: RelayOptions,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// 按配置初始化各模块；计量写入任务会在当前 tokio 运行时中启动
    pub fn from_config(config: &Config) -> Result<Self> {
        let proxy = Arc::new(ProxyForwarder::new(&config.proxy, config.providers.clone())?);
        let catalog = Arc::new(ModelCatalog::new(proxy.clone(), &config.catalog));

        Ok(Self {
            resolver: Arc::new(CredentialResolver::new(&config.auth)),
            adapters: Arc::new(Adapters::new(&config.providers)),
            proxy,
            catalog,
            meter: UsageMeter::from_config(&config.metering)?,
            relay_options: RelayOptions {
                idle_timeout: config.proxy.idle_timeout,
                max_line_bytes: config.proxy.max_line_bytes,
            },
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/usage", get(handlers::usage))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .with_state(state)
}
