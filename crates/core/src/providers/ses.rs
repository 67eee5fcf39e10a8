//! Amazon SES v2 adapter, on the AWS SDK.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_sesv2::Client;
use aws_sdk_sesv2::config::http::HttpResponse;
use aws_sdk_sesv2::config::{Credentials, Region};
use aws_sdk_sesv2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use tracing::{debug, error, warn};

use super::{
    ConnectionCheck, EmailMessage, ProviderAdapter, ProviderKind, SendReceipt, parse_base_url,
};
use crate::error::{ConfigurationError, ProviderError};

/// Long-term IAM credentials for SES.
#[derive(Clone)]
pub struct SesCredentials {
    /// Access key id, `AKIA...`.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Region hosting the SES account, e.g. `eu-west-1`.
    pub region: String,
}

impl std::fmt::Debug for SesCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SesCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Amazon SES provider.
pub struct SesProvider {
    client: Client,
    region: String,
    endpoint_url: Option<String>,
}

impl std::fmt::Debug for SesProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SesProvider")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

impl SesProvider {
    /// Create a provider, rejecting malformed credentials.
    ///
    /// `endpoint_url` replaces the regional SES endpoint (LocalStack, mock
    /// servers). SDK retries are off; the queue owns retrying.
    pub async fn new(
        credentials: SesCredentials,
        endpoint_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        validate_credentials(&credentials)?;
        if let Some(url) = endpoint_url {
            parse_base_url(url)?;
        }

        let SesCredentials {
            access_key_id,
            secret_access_key,
            region,
        } = credentials;
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "scholar-mail",
            ))
            .retry_config(RetryConfig::disabled())
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build());
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let config = loader.load().await;

        Ok(Self {
            client: Client::new(&config),
            region,
            endpoint_url: endpoint_url.map(ToString::to_string),
        })
    }
}

fn validate_credentials(credentials: &SesCredentials) -> Result<(), ConfigurationError> {
    let missing = |field| ConfigurationError::MissingCredential {
        provider: ProviderKind::Ses,
        field,
    };
    let malformed = |field, reason: &str| ConfigurationError::MalformedCredential {
        provider: ProviderKind::Ses,
        field,
        reason: reason.to_string(),
    };

    let key_id = credentials.access_key_id.trim();
    if key_id.is_empty() {
        return Err(missing("ses_access_key_id"));
    }
    if credentials.secret_access_key.trim().is_empty() {
        return Err(missing("ses_secret_access_key"));
    }
    if credentials.region.trim().is_empty() {
        return Err(missing("ses_region"));
    }

    if !(16..=128).contains(&key_id.len())
        || !key_id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(malformed(
            "ses_access_key_id",
            "expected 16-128 upper-case letters or digits",
        ));
    }
    if credentials.secret_access_key.len() < 16 {
        return Err(malformed(
            "ses_secret_access_key",
            "expected at least 16 characters",
        ));
    }
    if !is_region(&credentials.region) {
        return Err(malformed("ses_region", "expected a region such as eu-west-1"));
    }
    Ok(())
}

/// `eu-west-1`, `us-gov-west-1`, `ap-southeast-2`.
fn is_region(region: &str) -> bool {
    let parts: Vec<&str> = region.split('-').collect();
    let Some((number, words)) = parts.split_last() else {
        return false;
    };
    words.len() >= 2
        && words
            .iter()
            .all(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_lowercase()))
        && !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit())
}

/// RFC 5322 mailbox with an optional display name.
fn mailbox(address: &str, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.trim().is_empty() => {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\" <{address}>")
        }
        _ => address.to_string(),
    }
}

fn utf8(data: &str) -> Result<Content, ProviderError> {
    Content::builder()
        .data(data)
        .charset("UTF-8")
        .build()
        .map_err(|e| ProviderError::Request(e.to_string()))
}

fn email_content(message: &EmailMessage) -> Result<EmailContent, ProviderError> {
    let text = message.text_body.as_deref().map(utf8).transpose()?;
    let body = Body::builder()
        .html(utf8(&message.html_body)?)
        .set_text(text)
        .build();

    let simple = Message::builder()
        .subject(utf8(&message.subject)?)
        .body(body)
        .build();
    Ok(EmailContent::builder().simple(simple).build())
}

/// Map an SDK failure, keeping the HTTP status whenever SES answered.
fn provider_error<E>(err: &SdkError<E, HttpResponse>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err {
        SdkError::TimeoutError(_) => ProviderError::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => ProviderError::Timeout,
        SdkError::DispatchFailure(_) => {
            ProviderError::Transport(DisplayErrorContext(err).to_string())
        }
        SdkError::ConstructionFailure(_) => {
            ProviderError::Request(DisplayErrorContext(err).to_string())
        }
        _ => match err.raw_response() {
            Some(raw) => ProviderError::Http {
                status: raw.status().as_u16(),
                body: err.as_service_error().map_or_else(
                    || DisplayErrorContext(err).to_string(),
                    |e| {
                        format!(
                            "{}: {}",
                            e.code().unwrap_or("Unknown"),
                            e.message().unwrap_or_default()
                        )
                    },
                ),
            },
            None => ProviderError::Transport(DisplayErrorContext(err).to_string()),
        },
    }
}

#[async_trait]
impl ProviderAdapter for SesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ses
    }

    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, ProviderError> {
        let destination = Destination::builder()
            .to_addresses(mailbox(&message.to, message.to_name.as_deref()))
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(mailbox(&message.from_address, message.from_name.as_deref()))
            .destination(destination)
            .set_reply_to_addresses(message.reply_to.clone().map(|r| vec![r]))
            .content(email_content(message)?)
            .send()
            .await
            .map_err(|e| {
                let err = provider_error(&e);
                debug!(error = %err, "SES rejected message");
                err
            })?;

        // The message was accepted; a missing id must not turn that into a failure
        let provider_message_id = output
            .message_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string);
        match &provider_message_id {
            Some(id) => debug!(message_id = %id, "SES accepted message"),
            None => warn!(to = %message.to, "SES accepted message without a MessageId"),
        }

        Ok(SendReceipt {
            provider_message_id,
        })
    }

    async fn verify_connection(&self) -> ConnectionCheck {
        match self.client.get_account().send().await {
            Ok(account) if account.sending_enabled() => ConnectionCheck::ok(),
            Ok(_) => ConnectionCheck::failed("sending is disabled for this SES account"),
            Err(e) => {
                let err = provider_error(&e);
                error!(region = %self.region, error = %err, "SES account check failed");
                ConnectionCheck::failed(err.to_string())
            }
        }
    }
}
