use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum RetraceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            RetraceError::NotFound(m) => (axum::http::StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            RetraceError::InvalidUpload(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_UPLOAD",
            ),
            RetraceError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RetraceError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            RetraceError::Internal(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        if status.is_server_error() {
            tracing::error!("{}\n{}", self.inner, self.span_trace);
        }
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RetraceError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RetraceError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// JavaScript-style truthiness, which is what the log producer's consumers
/// used when reading optional flags out of request bodies.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness_matches_js() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("enabled")));
        assert!(is_truthy(&json!(1024)));
    }

    #[test]
    fn test_not_found_error_wraps_span_trace() {
        let err: ObservedError = RetraceError::NotFound("Request not found".into()).into();
        match err.inner {
            RetraceError::NotFound(msg) => assert_eq!(msg, "Request not found"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }
}
