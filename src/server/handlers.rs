use crate::auth::AuthContext;
use crate::error::{json_response, Error, Result};
use crate::models::{RequestContext, UsageOutcome};
use crate::protocol::openai::{ChatRequest, ModelList};
use crate::protocol::TranslatedResponse;
use crate::relay::{self, encoder::encode_stream, encoder::ChunkEncoder};
use crate::router::resolve_provider;
use crate::server::AppState;
use crate::telemetry::UsageScope;
use crate::usage_collector::StreamUsageCollector;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use serde_json::{json, Value};
use tracing::{error, info, warn};

const CHAT_COMPLETIONS: &str = "/v1/chat/completions";

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AuthContext> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.resolver.resolve(header)
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => {
            let mut response = Response::new(Body::from(handle.render()));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return e.into_response();
    }

    let data = state.catalog.list().await;
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
    .into_response()
}

/// 调用方自己的用量汇总
pub async fn usage(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let scope = match &auth.identity {
        Some(identity) => UsageScope::Identity(identity.clone()),
        None => UsageScope::Key(auth.key_id.clone()),
    };

    match state.meter.summary(scope).await {
        Some(summary) => Json(json!({
            "object": "usage",
            "key": auth.key_hint,
            "identity": auth.identity,
            "usage": summary,
        }))
        .into_response(),
        None => Error::Config("Usage metering is unavailable".into()).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth = match authorize(&state, &headers) {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed chat request: {}", e);
            return Error::InvalidRequest(format!("Invalid request body: {}", e)).into_response();
        }
    };

    let provider = resolve_provider(&request.model);
    let context = RequestContext::new(
        auth,
        CHAT_COMPLETIONS,
        request.model.clone(),
        provider,
        request.is_stream(),
        body,
    );

    info!(
        "[{}] Request received - key: {}, model: {}, provider: {}, stream: {}",
        context.request_id, context.auth.key_hint, context.model, provider, context.stream
    );

    if context.stream {
        stream_completion(state, context, request).await
    } else {
        complete(state, context, request).await
    }
}

fn record_failure(state: &AppState, context: &RequestContext, e: &Error) {
    state.meter.record(
        context,
        UsageOutcome {
            status: e.status().as_u16(),
            error: Some(e.to_string()),
            ..UsageOutcome::default()
        },
    );
}

// 非流式：等待上游完整响应，翻译后一次性返回
async fn complete(state: AppState, context: RequestContext, request: ChatRequest) -> Response {
    let adapter = state.adapters.get(context.provider);

    let result: Result<TranslatedResponse> = async {
        let upstream_body = adapter.build_request(&request, &context.raw_body)?;
        let raw = state.proxy.forward(adapter, upstream_body).await?;
        adapter.translate_response(raw, &context.model)
    }
    .await;

    match result {
        Ok(translated) => {
            state.meter.record(
                &context,
                UsageOutcome {
                    usage: translated.usage.unwrap_or_default(),
                    estimated: false,
                    status: StatusCode::OK.as_u16(),
                    error: None,
                },
            );
            json_response(StatusCode::OK, translated.body)
        }
        Err(e) => {
            error!("[{}] Request failed: {}", context.request_id, e);
            record_failure(&state, &context, &e);
            e.into_response()
        }
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // 禁用 nginx 缓冲
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

// 流式：上游握手成功后立即返回响应头，之后逐行翻译转发
async fn stream_completion(
    state: AppState,
    context: RequestContext,
    request: ChatRequest,
) -> Response {
    let adapter = state.adapters.get(context.provider);

    let upstream_body = match adapter.build_request(&request, &context.raw_body) {
        Ok(body) => body,
        Err(e) => {
            error!("[{}] Failed to build upstream request: {}", context.request_id, e);
            record_failure(&state, &context, &e);
            return e.into_response();
        }
    };

    let encoder = ChunkEncoder::new(context.model.clone());

    match state.proxy.open_stream(adapter, upstream_body).await {
        Ok(upstream) => {
            let frames = relay::relay(
                context.request_id.clone(),
                upstream,
                adapter.stream_decoder(),
                state.relay_options.clone(),
            );
            let collector = StreamUsageCollector::new(context, state.meter.clone());
            sse_response(encode_stream(frames, encoder, collector))
        }
        Err(e) if e.is_transport() => {
            // 连接失败也按流式协议返回一个错误事件
            warn!("[{}] Stream connect failed: {}", context.request_id, e);
            let collector = StreamUsageCollector::new(context, state.meter.clone());
            sse_response(encode_stream(relay::failed(e.to_string()), encoder, collector))
        }
        Err(e) => {
            error!("[{}] Stream request rejected upstream: {}", context.request_id, e);
            record_failure(&state, &context, &e);
            e.into_response()
        }
    }
}
