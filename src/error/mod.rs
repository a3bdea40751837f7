use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 与上游建立连接、等待数据或读取响应体时失败（含空闲超时）
    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    /// 上游返回了非 2xx 状态码，body 原样保留
    #[error("Upstream returned error status {status}")]
    UpstreamProvider { status: u16, body: Bytes },

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 对外暴露的 HTTP 状态码
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamProvider { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 传输层错误（连接失败、超时、读流失败）
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::UpstreamTransport(_) | Error::Http(_))
    }
}

/// 构造统一的错误信封 `{"error": {"message", "type", "code"}}`
pub fn error_envelope(message: &str, error_type: &str, code: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    })
}

pub fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let envelope = match &self {
            Error::UpstreamProvider { body, .. } => {
                return json_response(status, body.clone());
            }
            Error::Unauthenticated(msg) => {
                error_envelope(msg, "invalid_request_error", "invalid_api_key")
            }
            Error::InvalidRequest(msg) => {
                error_envelope(msg, "invalid_request_error", "invalid_request")
            }
            other => error_envelope(&other.to_string(), "server_error", "internal_error"),
        };
        json_response(status, envelope.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provider_error_keeps_status_and_body() {
        let body = Bytes::from_static(br#"{"error":{"message":"slow down"}}"#);
        let response = Error::UpstreamProvider {
            status: 429,
            body: body.clone(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes, body);
    }

    #[tokio::test]
    async fn transport_error_maps_to_server_error_envelope() {
        let response = Error::UpstreamTransport("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"]["type"], "server_error");
        assert_eq!(v["error"]["code"], "internal_error");
    }

    #[test]
    fn unauthenticated_is_401() {
        assert_eq!(
            Error::Unauthenticated("Invalid API key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
