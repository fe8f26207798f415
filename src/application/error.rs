use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    cache::{CacheError, FetchError},
    config::LoadError,
    infra::error::InfraError,
};

/// Diagnostic attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<CacheError> for HttpError {
    fn from(error: CacheError) -> Self {
        const SOURCE: &str = "infra::http::cache_error_to_http_error";
        match &error {
            CacheError::Unregistered { .. } => {
                HttpError::from_error(SOURCE, StatusCode::NOT_FOUND, "Unknown query", &error)
            }
            CacheError::Fetch(FetchError::InvalidArgs(_)) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Invalid query arguments",
                &error,
            ),
            CacheError::Fetch(_) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream content source failed",
                &error,
            ),
            CacheError::Store(_) => HttpError::from_error(
                SOURCE,
                StatusCode::SERVICE_UNAVAILABLE,
                "Cache store unavailable",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityType, OperationKind};

    #[test]
    fn cache_errors_map_to_statuses() {
        let cases = [
            (
                CacheError::Unregistered {
                    entity: EntityType::Globals,
                    kind: OperationKind::GetAll,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                CacheError::Fetch(FetchError::invalid_args("missing slug")),
                StatusCode::BAD_REQUEST,
            ),
            (
                CacheError::Fetch(FetchError::Upstream {
                    status: 500,
                    message: "boom".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (CacheError::store("offline"), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, expected) in cases {
            assert_eq!(HttpError::from(error).status(), expected);
        }
    }

    #[test]
    fn report_collects_the_source_chain() {
        let error = AppError::from(CacheError::Fetch(FetchError::Transport(
            "connection refused".to_string(),
        )));
        let report = ErrorReport::from_error("test", StatusCode::BAD_GATEWAY, &error);
        assert_eq!(
            report.messages.first().map(String::as_str),
            Some("upstream transport error: connection refused")
        );
    }
}
