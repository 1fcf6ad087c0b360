use actix_web::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::Utc;
use serde_json::json;

use crate::ledger::StoreError;
use crate::rate_limit::RateLimitDecision;
use crate::structs::FieldError;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Errors surfaced to HTTP clients. Internal detail stays in the logs; the
/// response bodies are fixed strings.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),
    #[error("request body could not be read")]
    InvalidPayload,
    #[error("invalid fields")]
    Validation(Vec<FieldError>),
    #[error("{public}: {source}")]
    Store {
        public: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("insight generation failed")]
    Analysis,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn store(public: &'static str, source: StoreError) -> Self {
        Self::Store { public, source }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidPayload | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Store { .. } | Self::Analysis | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            Self::Unauthorized => builder.json(json!({ "error": "Unauthorized" })),
            Self::RateLimited(decision) => {
                let now = Utc::now();
                builder
                    .insert_header((X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit)))
                    .insert_header((X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining)))
                    .insert_header((
                        X_RATELIMIT_RESET,
                        decision
                            .reset_at
                            .format("%a, %d %b %Y %H:%M:%S GMT")
                            .to_string(),
                    ))
                    .insert_header((RETRY_AFTER, decision.retry_after_secs(now).to_string()))
                    .insert_header((CONTENT_TYPE, "text/plain; charset=utf-8"))
                    .body("Too Many Requests")
            }
            Self::InvalidPayload => builder.json(json!({ "error": "Invalid fields" })),
            Self::Validation(details) => {
                builder.json(json!({ "error": "Invalid fields", "details": details }))
            }
            Self::Store { public, .. } => builder.json(json!({ "error": public })),
            Self::Analysis => builder
                .insert_header((CONTENT_TYPE, "text/plain; charset=utf-8"))
                .body("Internal Error"),
            Self::Internal => builder
                .insert_header((CONTENT_TYPE, "text/plain; charset=utf-8"))
                .body("Internal Server Error"),
        }
    }
}
