use axum::Json;
use axum::http::StatusCode;
use linear_github_sync_client::ErrorBody;

pub type ApiErrorTuple = (StatusCode, Json<ErrorBody>);

pub const MISSING_BODY_MESSAGE: &str = "Request is missing body";
pub const METHOD_NOT_ALLOWED_MESSAGE: &str = "Only POST requests are accepted.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    MissingBody,
    MethodNotAllowed,
    InvalidBody,
    MissingField,
    StoreFailure,
    UpstreamFailure,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingBody => "missing_body",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::InvalidBody => "invalid_body",
            Self::MissingField => "missing_field",
            Self::StoreFailure => "store_failure",
            Self::UpstreamFailure => "upstream_failure",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::MissingBody | Self::InvalidBody => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingField | Self::StoreFailure | Self::UpstreamFailure => {
                StatusCode::NOT_FOUND
            }
        }
    }

    /// Envelope failures answer with `{message}`, route failures with `{error}`.
    const fn uses_message_field(self) -> bool {
        matches!(self, Self::MissingBody | Self::MethodNotAllowed)
    }
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(code.default_status(), code, message)
}

pub fn error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> ApiErrorTuple {
    let message = message.into();
    tracing::debug!(
        target: "linear_github_sync.http",
        code = code.as_str(),
        status = status.as_u16(),
        message = %message,
        "request rejected",
    );
    let body = if code.uses_message_field() {
        ErrorBody {
            error: None,
            message: Some(message),
        }
    } else {
        ErrorBody {
            error: Some(message),
            message: None,
        }
    };
    (status, Json(body))
}

pub fn missing_body() -> ApiErrorTuple {
    error_response(ApiErrorCode::MissingBody, MISSING_BODY_MESSAGE)
}

pub fn method_not_allowed() -> ApiErrorTuple {
    error_response(ApiErrorCode::MethodNotAllowed, METHOD_NOT_ALLOWED_MESSAGE)
}

pub fn missing_field(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::MissingField, message)
}

/// `Failed to <operation> with error: <detail>`.
pub fn operation_failed(
    code: ApiErrorCode,
    operation: &str,
    detail: impl std::fmt::Display,
) -> ApiErrorTuple {
    error_response(code, format!("Failed to {operation} with error: {detail}"))
}
