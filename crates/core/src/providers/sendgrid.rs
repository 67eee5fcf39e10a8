//! `SendGrid` v3 mail API adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ConnectionCheck, EmailMessage, ProviderAdapter, ProviderKind, SendReceipt, endpoint,
    error_from_response, http_client, parse_base_url,
};
use crate::error::{ConfigurationError, ProviderError};

/// Production API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";

/// `SendGrid` provider.
pub struct SendGridProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for SendGridProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendGridProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SendGridProvider {
    /// Create a provider, rejecting a malformed API key.
    pub fn new(
        api_key: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        validate_api_key(api_key)?;
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL);
        parse_base_url(base_url)?;

        Ok(Self {
            client: http_client(timeout)?,
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
        })
    }
}

/// `SendGrid` keys look like `SG.<id>.<secret>`.
fn validate_api_key(api_key: &str) -> Result<(), ConfigurationError> {
    if api_key.trim().is_empty() {
        return Err(ConfigurationError::MissingCredential {
            provider: ProviderKind::SendGrid,
            field: "sendgrid_api_key",
        });
    }

    let segments: Vec<&str> = api_key.split('.').collect();
    if !api_key.starts_with("SG.") || segments.len() != 3 || segments.iter().any(|s| s.is_empty())
    {
        return Err(ConfigurationError::MalformedCredential {
            provider: ProviderKind::SendGrid,
            field: "sendgrid_api_key",
            reason: "expected SG.<id>.<secret>".to_string(),
        });
    }
    Ok(())
}

#[derive(Serialize)]
struct MailSendRequest<'a> {
    personalizations: [Personalization<'a>; 1],
    from: Address<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address<'a>>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: [Address<'a>; 1],
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

impl<'a> MailSendRequest<'a> {
    fn from_message(message: &'a EmailMessage) -> Self {
        // text/plain must precede text/html
        let mut content = Vec::with_capacity(2);
        if let Some(text) = message.text_body.as_deref() {
            content.push(Content {
                content_type: "text/plain",
                value: text,
            });
        }
        content.push(Content {
            content_type: "text/html",
            value: &message.html_body,
        });

        Self {
            personalizations: [Personalization {
                to: [Address {
                    email: &message.to,
                    name: message.to_name.as_deref(),
                }],
            }],
            from: Address {
                email: &message.from_address,
                name: message.from_name.as_deref(),
            },
            reply_to: message.reply_to.as_deref().map(|email| Address { email, name: None }),
            subject: &message.subject,
            content,
        }
    }
}

#[derive(Deserialize)]
struct ScopesResponse {
    #[serde(default)]
    scopes: Vec<String>,
}

#[async_trait]
impl ProviderAdapter for SendGridProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SendGrid
    }

    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, ProviderError> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "/v3/mail/send"))
            .bearer_auth(&self.api_key)
            .json(&MailSendRequest::from_message(message))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let provider_message_id = response
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        debug!(message_id = ?provider_message_id, "SendGrid accepted message");

        Ok(SendReceipt {
            provider_message_id,
        })
    }

    async fn verify_connection(&self) -> ConnectionCheck {
        let response = match self
            .client
            .get(endpoint(&self.base_url, "/v3/scopes"))
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return ConnectionCheck::failed(ProviderError::from(e).to_string()),
        };

        if !response.status().is_success() {
            return ConnectionCheck::failed(error_from_response(response).await.to_string());
        }

        match response.json::<ScopesResponse>().await {
            Ok(body) if body.scopes.iter().any(|s| s == "mail.send") => ConnectionCheck::ok(),
            Ok(_) => ConnectionCheck::failed("API key lacks the mail.send scope"),
            Err(e) => ConnectionCheck::failed(format!("invalid scopes response: {e}")),
        }
    }
}
