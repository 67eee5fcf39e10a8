//! Email provider adapters.
//!
//! Every third-party email API sits behind [`ProviderAdapter`]. The active
//! adapter is chosen once at startup by [`ProviderFactory`]; nothing else in
//! the pipeline knows which provider it is talking to.

mod factory;
mod sendgrid;
mod ses;

#[cfg(any(test, feature = "test-utils"))]
mod scripted;

pub use factory::ProviderFactory;
pub use sendgrid::SendGridProvider;
pub use ses::{SesCredentials, SesProvider};

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedOutcome, ScriptedProvider};

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ProviderError};

/// Supported email providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `SendGrid` v3 mail API.
    SendGrid,
    /// Amazon SES v2 API.
    Ses,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendGrid => write!(f, "sendgrid"),
            Self::Ses => write!(f, "ses"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sendgrid" | "sg" => Ok(Self::SendGrid),
            "ses" | "aws_ses" | "aws-ses" => Ok(Self::Ses),
            _ => Err(ConfigurationError::UnknownProvider(s.to_string())),
        }
    }
}

/// A single-recipient message ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Recipient display name.
    pub to_name: Option<String>,
    /// Sender address.
    pub from_address: String,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html_body: String,
    /// Plain text body.
    pub text_body: Option<String>,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider message id, when the provider returns one.
    pub provider_message_id: Option<String>,
}

/// Outcome of [`ProviderAdapter::send_bulk`].
#[derive(Debug, Default)]
pub struct BulkSendReport {
    /// Messages the provider accepted.
    pub total_sent: usize,
    /// Messages that failed.
    pub total_failed: usize,
    /// One entry per input message, in order.
    pub results: Vec<Result<SendReceipt, ProviderError>>,
}

/// Result of a connectivity and credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionCheck {
    /// The provider is reachable and accepts our credentials.
    pub success: bool,
    /// Why the check failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionCheck {
    /// A passing check.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failing check.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A third-party email API.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this is. For logs.
    fn kind(&self) -> ProviderKind;

    /// Send one message.
    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, ProviderError>;

    /// Send several messages. A failure never stops the remaining sends.
    async fn send_bulk(&self, messages: &[EmailMessage]) -> BulkSendReport {
        let mut report = BulkSendReport::default();
        for message in messages {
            let result = self.send(message).await;
            if result.is_ok() {
                report.total_sent += 1;
            } else {
                report.total_failed += 1;
            }
            report.results.push(result);
        }
        report
    }

    /// Check that the provider is reachable and accepts our credentials.
    async fn verify_connection(&self) -> ConnectionCheck;
}

/// Join a validated base URL and an absolute API path.
fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

/// Validate an API base URL override.
fn parse_base_url(url: &str) -> Result<url::Url, ConfigurationError> {
    let parsed = url::Url::parse(url).map_err(|e| ConfigurationError::InvalidBaseUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigurationError::InvalidBaseUrl {
            url: url.to_string(),
            reason: "expected an http(s) URL with a host".to_string(),
        });
    }
    Ok(parsed)
}

fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ConfigurationError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("scholar-mail/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigurationError::HttpClient(e.to_string()))
}

/// Read a non-success response into a [`ProviderError::Http`].
async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Http { status, body }
}
