// Error taxonomy
//
// Lower-level failures (one mirror, one strategy) are absorbed and logged where
// they happen. Only exhausting every option at a level becomes a RelayError,
// which renders as the JSON error envelope with actionable suggestions.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),

    /// Provider unsupported, or the requested role is missing
    #[error("No {role} module for provider: {provider}")]
    ModuleUnavailable { provider: String, role: String },

    /// Sandboxed code threw or its promise rejected
    #[error("Provider module failed: {message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Request aborted")]
    Aborted,

    #[error("Content extraction failed")]
    NoCandidates { provider: String, link: String },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Wire shape of every error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(rename = "originalUrl", skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ModuleUnavailable { .. } => StatusCode::NOT_FOUND,
            Self::Execution { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Network(_) | Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            // Client closed request
            Self::Aborted => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::NoCandidates { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Build the envelope; every variant carries at least one suggestion
    pub fn body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            error: self.to_string(),
            details: None,
            reasons: Vec::new(),
            suggestions: Vec::new(),
            original_url: None,
            provider: None,
        };

        match self {
            Self::BadRequest(_) => {
                body.suggestions = strings(&["Check the required query parameters"]);
            }
            Self::ModuleUnavailable { provider, .. } => {
                body.provider = Some(provider.clone());
                body.suggestions = strings(&[
                    "Check the provider name against /api/providers",
                    "Retry with refresh=true in case the module mirrors were unreachable",
                ]);
            }
            Self::Execution { stack, .. } => {
                body.details = stack.clone();
                body.suggestions = strings(&[
                    "Retry with refresh=true to fetch the latest module",
                    "Try a different provider if available",
                ]);
            }
            Self::Network(_) | Self::UpstreamUnavailable(_) => {
                body.suggestions = strings(&[
                    "Check if the content is still available",
                    "Retry in a moment",
                ]);
            }
            Self::Timeout(_) => {
                body.details = Some("Try again or check if the provider is working".to_string());
                body.suggestions = strings(&["Try again", "Try a different provider if available"]);
            }
            Self::Aborted => {
                body.suggestions = strings(&["Retry the request"]);
            }
            Self::NoCandidates { provider, link } => {
                body.details = Some(
                    "The provider was unable to extract content from the URL. This could be due to:"
                        .to_string(),
                );
                body.reasons = strings(&[
                    "The website is blocking automated requests (Cloudflare protection)",
                    "The content has been removed or is no longer available",
                    "The URL format is not supported by this provider",
                    "The provider module needs to be updated",
                ]);
                body.suggestions = strings(&[
                    "Try refreshing the page",
                    "Check if the content is still available",
                    "Try a different provider if available",
                    "Contact support if the issue persists",
                ]);
                body.original_url = Some(link.clone());
                body.provider = Some(provider.clone());
            }
            Self::Internal(_) => {
                body.suggestions = strings(&["Retry the request", "Contact support if the issue persists"]);
            }
        }

        body
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        } else {
            log::warn!("{}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<RelayError> {
        vec![
            RelayError::BadRequest("provider and link required".to_string()),
            RelayError::ModuleUnavailable {
                provider: "mod".to_string(),
                role: "stream".to_string(),
            },
            RelayError::Execution {
                message: "boom".to_string(),
                stack: None,
            },
            RelayError::Network("connection refused".to_string()),
            RelayError::Timeout("getStream".to_string()),
            RelayError::Aborted,
            RelayError::NoCandidates {
                provider: "mod".to_string(),
                link: "https://example.com/x".to_string(),
            },
            RelayError::UpstreamUnavailable("dns".to_string()),
            RelayError::Internal(anyhow::anyhow!("unexpected")),
        ]
    }

    #[test]
    fn test_every_error_has_a_suggestion() {
        for err in all_variants() {
            assert!(!err.body().suggestions.is_empty(), "{:?}", err);
        }
    }

    #[test]
    fn test_status_codes() {
        let statuses: Vec<u16> = all_variants().iter().map(|e| e.status().as_u16()).collect();
        assert_eq!(statuses, vec![400, 404, 500, 502, 408, 499, 422, 502, 500]);
    }

    #[test]
    fn test_no_candidates_lists_reasons() {
        let err = RelayError::NoCandidates {
            provider: "mod".to_string(),
            link: "https://example.com/x".to_string(),
        };
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["error"], "Content extraction failed");
        assert_eq!(body["reasons"].as_array().unwrap().len(), 4);
        assert_eq!(body["originalUrl"], "https://example.com/x");
    }
}
