use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::{
    artifacts::{FetchError, ServeError},
    extraction::ExtractionError,
    verification::VerificationError,
};

const MAX_DETAIL_CHARS: usize = 300;

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    restricted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Request-scoped failure rendered as `{ok: false, ...}` JSON.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: &'static str,
    pub restricted: bool,
    pub detail: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            restricted: false,
            detail: None,
            retry_after_seconds: None,
        }
    }

    fn with_detail(mut self, detail: impl AsRef<str>) -> Self {
        let detail = truncate_detail(detail.as_ref());
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        let mut error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Rate limit exceeded. Try again in a few minutes.",
        );
        error.retry_after_seconds = Some(retry_after_seconds);
        error
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "ARTIFACT_NOT_FOUND", message)
    }
}

impl From<ExtractionError> for ApiError {
    fn from(error: ExtractionError) -> Self {
        match error {
            ExtractionError::Restricted { detail } => {
                let mut api = Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "RESTRICTED",
                    "This platform is blocking automated access for this link. Only public content can be downloaded; try another public link.",
                )
                .with_detail(detail);
                api.restricted = true;
                api
            }
            ExtractionError::Timeout { seconds } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "UPSTREAM_TIMEOUT",
                format!("The source did not respond within {seconds} seconds. Try again later."),
            ),
            ExtractionError::Generic { detail } => Self::new(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_FAILED",
                "Could not retrieve this media. Check the link or try another format.",
            )
            .with_detail(detail),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Extraction(inner) => inner.into(),
            FetchError::ProducedFileMissing { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "PRODUCED_FILE_MISSING",
                "The download finished but no file was produced. Try another format.",
            ),
            FetchError::TooLarge { max_bytes, .. } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "ARTIFACT_TOO_LARGE",
                format!(
                    "The file exceeds the {} MB limit.",
                    max_bytes / 1_048_576
                ),
            ),
            FetchError::Io { context, source } => {
                warn!("artifact storage failure while {context}: {source}");
                Self::internal("Could not prepare the download on the server.")
            }
        }
    }
}

impl From<ServeError> for ApiError {
    fn from(error: ServeError) -> Self {
        match error {
            ServeError::NotReady | ServeError::Gone => {
                Self::not_found("This download has expired or does not exist.")
            }
            ServeError::Io(source) => {
                warn!("could not open artifact for streaming: {source}");
                Self::internal("Could not read the downloaded file.")
            }
        }
    }
}

impl From<VerificationError> for ApiError {
    fn from(error: VerificationError) -> Self {
        match error {
            VerificationError::Misconfigured => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "VERIFICATION_MISCONFIGURED",
                "Verification is enabled but not configured on the server.",
            ),
            VerificationError::TokenMissing => Self::new(
                StatusCode::FORBIDDEN,
                "VERIFICATION_REQUIRED",
                "Please complete the verification to continue.",
            ),
            VerificationError::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "VERIFICATION_UNAVAILABLE",
                "Could not validate the verification. Please try again.",
            ),
            VerificationError::Rejected { ref codes } => Self::new(
                StatusCode::FORBIDDEN,
                "VERIFICATION_FAILED",
                VerificationError::message_for_codes(codes),
            ),
            VerificationError::HostnameMismatch { .. } => Self::new(
                StatusCode::FORBIDDEN,
                "VERIFICATION_FAILED",
                "Verification was issued for a different site. Reload the page and retry.",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            ok: false,
            error: self.message,
            code: self.code,
            restricted: self.restricted,
            detail: self.detail,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

fn truncate_detail(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= MAX_DETAIL_CHARS {
        return trimmed.to_string();
    }

    let mut truncated: String = trimmed.chars().take(MAX_DETAIL_CHARS).collect();
    truncated.push('…');
    truncated
}
