use crate::protocol::error_shapes::anthropic_error_payload;

/// Gateway error type used across all modules.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The backend rejected the request (unmapped model, auth, quota...).
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    /// The backend produced tool-call data that cannot be turned into a
    /// front-protocol tool call.
    #[error("Tool call conversion error for '{tool_call_id}': {message}")]
    Conversion {
        tool_call_id: String,
        message: String,
    },
    #[error("Stream cancelled: {0}")]
    Cancelled(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Overloaded,
    /// Backend answered, but with tool-call data we could not convert.
    UnprocessableUpstream,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::RateLimit,
        529 => ErrorCategory::Overloaded,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::Upstream { status, .. } => category_from_upstream_status(*status),
            GatewayError::Conversion { .. } => ErrorCategory::UnprocessableUpstream,
            GatewayError::Cancelled(_) => ErrorCategory::Unknown,
            GatewayError::Config(_) | GatewayError::Transport(_) | GatewayError::Internal(_) => {
                ErrorCategory::ServerError
            }
        }
    }

    /// Whether the fault originated in the backend's own verdict rather than
    /// in local processing.
    #[must_use]
    pub fn is_upstream_rejection(&self) -> bool {
        matches!(self, GatewayError::Upstream { .. })
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::UnprocessableUpstream => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::Overloaded => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Status code for an error. Upstream rejections keep the backend's own
/// status so the client sees the real cause.
#[must_use]
pub fn http_status_for(err: &GatewayError) -> http::StatusCode {
    if let GatewayError::Upstream { status, .. } = err {
        if let Ok(code) = http::StatusCode::from_u16(*status) {
            if code.is_client_error() || code.is_server_error() {
                return code;
            }
        }
    }
    http_status_for_category(err.category())
}

/// Format an error as a front-protocol error body, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for(err);
    (status, anthropic_error_payload(err.category(), &client_message(err)))
}

/// Message shown to the client. Upstream rejections pass the backend's text
/// through verbatim.
#[must_use]
pub fn client_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Upstream { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_rejection_keeps_backend_status_and_message() {
        let err = GatewayError::Upstream {
            status: 400,
            message: "Invalid model. Please select a different model to continue.".into(),
        };
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(
            body["error"]["message"],
            "Invalid model. Please select a different model to continue."
        );
        assert!(err.is_upstream_rejection());
    }

    #[test]
    fn conversion_fault_is_distinct_from_upstream_rejection() {
        let err = GatewayError::Conversion {
            tool_call_id: "tooluse_1".into(),
            message: "EOF while parsing".into(),
        };
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "api_error");
        assert!(body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("tooluse_1")));
        assert!(!err.is_upstream_rejection());
    }

    #[test]
    fn upstream_status_outside_error_range_falls_back_to_category() {
        let err = GatewayError::Upstream {
            status: 200,
            message: "odd".into(),
        };
        assert_eq!(
            http_status_for(&err),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
