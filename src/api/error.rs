use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::debug::DebugError;
use crate::registry::RegistryError;
use crate::session::SessionError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 410 - The session was closed and will not be recreated.
    SessionClosed(String),
    /// 403 - The server or session refuses new viewers.
    Forbidden(String),
    /// 400 - No agent profile with this name.
    UnknownAgent(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 503 - DOM query sent with no browser attached.
    NoBrowser,
    /// 409 - DOM query replaced by a newer one before it was answered.
    QuerySuperseded,
    /// 504 - The browser did not answer a DOM query in time.
    QueryTimeout,
    /// 409 - A process transition is already underway.
    Busy,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionClosed(_) => StatusCode::GONE,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::UnknownAgent(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NoBrowser => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::QuerySuperseded => StatusCode::CONFLICT,
            ApiError::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SessionClosed(_) => "session_closed",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::UnknownAgent(_) => "unknown_agent",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NoBrowser => "no_browser",
            ApiError::QuerySuperseded => "query_superseded",
            ApiError::QueryTimeout => "query_timeout",
            ApiError::Busy => "busy",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::SessionClosed(id) => format!("Session was closed: {}.", id),
            ApiError::Forbidden(detail) => format!("Forbidden: {}.", detail),
            ApiError::UnknownAgent(name) => format!("Unknown agent profile: {}.", name),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::NoBrowser => "No browser is connected to this debug channel.".to_string(),
            ApiError::QuerySuperseded => "Query was superseded by a newer query.".to_string(),
            ApiError::QueryTimeout => "Browser did not answer the query in time.".to_string(),
            ApiError::Busy => "A process transition is already in progress.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            RegistryError::Closed(id) => ApiError::SessionClosed(id),
            RegistryError::Forbidden(detail) => ApiError::Forbidden(detail),
            RegistryError::UnknownAgent(name) => ApiError::UnknownAgent(name),
            RegistryError::Session(SessionError::Busy) => ApiError::Busy,
            RegistryError::Session(SessionError::Closing) => ApiError::Forbidden("session is closing".into()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<DebugError> for ApiError {
    fn from(e: DebugError) -> Self {
        match e {
            DebugError::NoBrowser => ApiError::NoBrowser,
            DebugError::Superseded => ApiError::QuerySuperseded,
            DebugError::Timeout => ApiError::QueryTimeout,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn session_not_found_body() {
        let (status, json) = response_parts(ApiError::SessionNotFound("abc".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "session_not_found");
        assert_eq!(json["error"]["message"], "Session not found: abc.");
    }

    #[tokio::test]
    async fn debug_errors_map_to_distinct_statuses() {
        let (status, json) = response_parts(DebugError::NoBrowser.into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "no_browser");

        let (status, json) = response_parts(DebugError::Superseded.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "query_superseded");

        let (status, _) = response_parts(DebugError::Timeout.into()).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn registry_errors_map() {
        let (status, _) = response_parts(RegistryError::Forbidden("draining".into()).into()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) = response_parts(RegistryError::Closed("abc".into()).into()).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(json["error"]["code"], "session_closed");

        let (status, json) = response_parts(RegistryError::UnknownAgent("nope".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "unknown_agent");

        let (status, _) = response_parts(RegistryError::Session(SessionError::Busy).into()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let (status, json) = response_parts(RegistryError::Workspace("/w".into(), io).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["code"], "internal_error");
    }

    #[tokio::test]
    async fn every_variant_has_error_envelope() {
        let all = vec![
            ApiError::SessionNotFound("x".into()),
            ApiError::SessionClosed("x".into()),
            ApiError::Forbidden("x".into()),
            ApiError::UnknownAgent("x".into()),
            ApiError::InvalidRequest("x".into()),
            ApiError::NoBrowser,
            ApiError::QuerySuperseded,
            ApiError::QueryTimeout,
            ApiError::Busy,
            ApiError::InternalError("x".into()),
        ];
        for err in all {
            let code = err.code();
            let (_, json) = response_parts(err).await;
            assert_eq!(json["error"]["code"], code);
            assert!(json["error"]["message"].as_str().is_some_and(|m| !m.is_empty()));
        }
    }
}
