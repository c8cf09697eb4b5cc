use std::path::PathBuf;

use reqwest::StatusCode;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The identity endpoint rejected the credentials. Never retried.
    #[error("authentication failed (HTTP {status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("identity request failed for {url}{}: {body}", status_suffix(.status))]
    IdentityRequest {
        url: String,
        status: Option<u16>,
        body: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("catalog request failed for {url}{}: {body}", status_suffix(.status))]
    CatalogRequest {
        url: String,
        status: Option<u16>,
        body: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("failed to parse catalog response from {url}")]
    CatalogParse {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("invalid geometry in {}: {reason}", .path.display())]
    GeometryFormat { path: PathBuf, reason: String },

    #[error("invalid search parameters: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Terminal failure of a single product download.
#[derive(Debug, thiserror::Error)]
#[error("download of product {product_id} failed: {kind}")]
pub struct DownloadError {
    pub product_id: String,
    pub path: PathBuf,
    #[source]
    pub kind: DownloadErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadErrorKind {
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("network error while fetching {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("transfer from {url} was interrupted")]
    Interrupted {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("filesystem error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("expected {expected} byte(s), received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("MD5 mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("too many redirects starting at {url}")]
    TooManyRedirects { url: String },
    #[error("could not obtain a bearer token")]
    Auth(#[source] Box<Error>),
    #[error("cancelled")]
    Cancelled,
}

impl DownloadError {
    pub(crate) fn new(product_id: &str, path: impl Into<PathBuf>, kind: DownloadErrorKind) -> Self {
        Self {
            product_id: product_id.to_string(),
            path: path.into(),
            kind,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, DownloadErrorKind::Cancelled)
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Error payloads seen from CDSE services.
///
/// Keycloak answers `{"error": "...", "error_description": "..."}`, the OData
/// catalog answers `{"detail": ...}` or `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, serde::Deserialize)]
struct ServiceErrorResponse {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Condenses a response body into a single diagnostic line.
pub(crate) fn summarize_body(status: StatusCode, text: &str) -> String {
    if let Ok(e) = serde_json::from_str::<ServiceErrorResponse>(text) {
        let error = match &e.error {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(o)) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        let detail = match &e.detail {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(o)) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(Value::Object(o.clone()).to_string())),
            Some(other) => Some(other.to_string()),
            None => None,
        };

        let parts: Vec<String> = [error, e.error_description, detail, e.message]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if !parts.is_empty() {
            return parts.join(": ");
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("empty response body")
            .to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycloak_error_is_condensed() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid user credentials"}"#;
        assert_eq!(
            summarize_body(StatusCode::UNAUTHORIZED, body),
            "invalid_grant: Invalid user credentials"
        );
    }

    #[test]
    fn odata_error_object_uses_message() {
        let body = r#"{"error":{"code":"400","message":"Invalid filter"}}"#;
        assert_eq!(summarize_body(StatusCode::BAD_REQUEST, body), "Invalid filter");
    }

    #[test]
    fn plain_text_and_empty_bodies() {
        assert_eq!(summarize_body(StatusCode::BAD_GATEWAY, "  upstream down \n"), "upstream down");
        assert_eq!(summarize_body(StatusCode::BAD_GATEWAY, ""), "Bad Gateway");
    }

    #[test]
    fn catalog_error_display_carries_status() {
        let err = Error::CatalogRequest {
            url: "http://x/Products".into(),
            status: Some(400),
            body: "Invalid filter".into(),
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "catalog request failed for http://x/Products (HTTP 400): Invalid filter"
        );
    }
}
