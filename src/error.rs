use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the provider client.
///
/// Data-quality problems never show up here; the reconciliation engine
/// turns those into classified statuses instead.
#[derive(Debug, Error)]
pub enum Error {
    /// An authorized call came back with a failure status.
    #[error("HTTP {status} for {url}")]
    Http { status: StatusCode, url: String },

    /// The login flow broke somewhere other than an HTTP status
    /// (settings blob not found, authorization code not found, ...).
    #[error("{0}")]
    AuthFlow(String),

    /// The account has no usable occupation/location record. Not retried
    /// automatically; this persists until the account data changes.
    #[error("{0}")]
    AccountConfig(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl Error {
    pub fn flow(message: impl Into<String>) -> Self {
        Error::AuthFlow(message.into())
    }

    pub fn account(message: impl Into<String>) -> Self {
        Error::AccountConfig(message.into())
    }

    /// The one failure category eligible for quick scheduler-level retries.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Http { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }

    pub fn is_account_config(&self) -> bool {
        matches!(self, Error::AccountConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_message_names_status_and_url() {
        let err = Error::Http {
            status: StatusCode::UNAUTHORIZED,
            url: "https://example.invalid/api/v1/resident".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 401 Unauthorized for https://example.invalid/api/v1/resident"
        );
        assert!(err.is_unauthorized());
    }

    #[test]
    fn only_401_counts_as_unauthorized() {
        let err = Error::Http {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            url: "https://example.invalid".to_string(),
        };
        assert!(!err.is_unauthorized());
        assert!(!Error::flow("Authorization code not found.").is_unauthorized());
    }
}
