//! Error types for providers, dispatch and job validation.

use thiserror::Error;

use crate::providers::ProviderKind;

/// Provider configuration is missing or malformed.
///
/// Raised while building an adapter; the process should refuse to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown email provider: {0}")]
    UnknownProvider(String),

    #[error("{provider} requires {field}")]
    MissingCredential {
        provider: ProviderKind,
        field: &'static str,
    },

    #[error("malformed {field} for {provider}: {reason}")]
    MalformedCredential {
        provider: ProviderKind,
        field: &'static str,
        reason: String,
    },

    #[error("invalid API base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Raw failure reported by a provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("failed to build provider request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Normalized outcome of a failed single-recipient send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Transient provider or network failure; try again later.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider rejected our credentials. Needs an operator.
    #[error("provider authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The provider (or local validation) rejected this recipient.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The provider throttled us; back off longer than for a plain outage.
    #[error("rate limited by provider: {0}")]
    RateLimitedByProvider(String),
}

impl DispatchError {
    /// Whether a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::RateLimitedByProvider(_)
        )
    }

    /// Whether the provider asked us to slow down.
    #[must_use]
    pub const fn is_throttle(&self) -> bool {
        matches!(self, Self::RateLimitedByProvider(_))
    }
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::Http { status, body } => match status {
                401 | 403 => Self::AuthenticationFailed(message),
                429 => Self::RateLimitedByProvider(message),
                // Wrong endpoint or API path, nothing to do with the recipient
                404 | 405 | 408 => Self::ProviderUnavailable(message),
                400..=499 if has_code(&body, THROTTLING_CODES) => {
                    Self::RateLimitedByProvider(message)
                }
                400..=499 if has_code(&body, ACCOUNT_CODES) => Self::AuthenticationFailed(message),
                400..=499 => Self::InvalidRecipient(message),
                _ => Self::ProviderUnavailable(message),
            },
            ProviderError::Transport(_)
            | ProviderError::Timeout
            | ProviderError::Request(_) => Self::ProviderUnavailable(message),
        }
    }
}

/// AWS reports some throttling as a 400 with an error code in the body.
const THROTTLING_CODES: &[&str] = &["Throttling", "TooManyRequests", "LimitExceeded"];

/// 4xx codes that block every send from the account until an operator acts.
const ACCOUNT_CODES: &[&str] = &[
    "SendingPausedException",
    "AccountSuspendedException",
    "MailFromDomainNotVerifiedException",
    "NotFoundException",
];

fn has_code(body: &str, codes: &[&str]) -> bool {
    codes.iter().any(|code| body.contains(code))
}

/// A submission that cannot become a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobValidationError {
    #[error("at least one recipient is required")]
    NoRecipients,

    #[error("recipient id must not be empty")]
    EmptyRecipientId,

    #[error("duplicate recipient id: {0}")]
    DuplicateRecipient(String),

    #[error("invalid email address for recipient {recipient_id}: {email}")]
    InvalidEmail { recipient_id: String, email: String },

    #[error("subject must not be empty")]
    EmptySubject,

    #[error("html or text content is required")]
    MissingContent,

    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template {template} requires field {field}")]
    MissingTemplateField {
        template: &'static str,
        field: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, body: &str) -> DispatchError {
        ProviderError::Http {
            status,
            body: body.to_string(),
        }
        .into()
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(http(500, ""), DispatchError::ProviderUnavailable(_)));
        assert!(matches!(http(503, ""), DispatchError::ProviderUnavailable(_)));
        assert!(matches!(http(408, ""), DispatchError::ProviderUnavailable(_)));
        assert!(matches!(http(401, ""), DispatchError::AuthenticationFailed(_)));
        assert!(matches!(http(403, ""), DispatchError::AuthenticationFailed(_)));
        assert!(matches!(http(429, ""), DispatchError::RateLimitedByProvider(_)));
        assert!(matches!(http(400, "bad address"), DispatchError::InvalidRecipient(_)));
        assert!(matches!(http(422, ""), DispatchError::InvalidRecipient(_)));
    }

    #[test]
    fn test_throttling_code_in_body() {
        let err = http(400, r#"{"__type":"ThrottlingException"}"#);
        assert!(err.is_throttle());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        let err: DispatchError = ProviderError::Transport("connection reset".into()).into();
        assert!(err.is_retryable());
        let err: DispatchError = ProviderError::Timeout.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_account_level_rejections_need_an_operator() {
        for code in [
            "SendingPausedException",
            "AccountSuspendedException",
            "MailFromDomainNotVerifiedException",
        ] {
            let err = http(400, &format!("{code}: sending blocked"));
            assert!(
                matches!(err, DispatchError::AuthenticationFailed(_)),
                "{code} classified as {err:?}"
            );
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_address_rejection_stays_per_recipient() {
        let err = http(400, "MessageRejected: Email address is not verified.");
        assert!(matches!(err, DispatchError::InvalidRecipient(_)));
    }

    #[test]
    fn test_wrong_endpoint_is_not_a_recipient_error() {
        assert!(matches!(http(404, ""), DispatchError::ProviderUnavailable(_)));
        assert!(matches!(http(405, ""), DispatchError::ProviderUnavailable(_)));
        let err: DispatchError = ProviderError::Request("missing field".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permanent_failures() {
        assert!(!http(401, "").is_retryable());
        assert!(!http(400, "").is_retryable());
    }
}
