//! Single-attempt delivery through the active provider.

use std::collections::BTreeMap;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use scholar_common::MailConfig;
use tracing::{debug, error, warn};

use crate::error::DispatchError;
use crate::models::{EmailJob, Recipient, RecipientResult};
use crate::providers::{ConnectionCheck, EmailMessage, ProviderAdapter, ProviderKind, SendReceipt};

/// Who outgoing mail is from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    /// Envelope and header sender address.
    pub from_address: String,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Where replies should go.
    pub reply_to: Option<String>,
}

/// Outcome of one pass over a job's unresolved recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSweep {
    /// One entry per recipient of the job. Recipients the pass did not
    /// reach keep their previous result.
    pub results: BTreeMap<String, RecipientResult>,
    /// Sends attempted in this pass.
    pub attempted: usize,
    /// A send was throttled by the provider.
    pub throttled: bool,
    /// A send failed with a transient outage.
    pub unavailable: bool,
    /// Last error seen in this pass.
    pub last_error: Option<String>,
    /// The gate stopped the pass early and asked for this wait.
    pub halted: Option<Duration>,
}

impl BulkSweep {
    /// Recipients still neither sent nor failed for good.
    #[must_use]
    pub fn unresolved(&self) -> usize {
        self.results.values().filter(|r| !r.is_resolved()).count()
    }

    /// Whether a send in this pass failed in a way a later pass may fix.
    #[must_use]
    pub const fn had_retryable_failure(&self) -> bool {
        self.throttled || self.unavailable
    }
}

impl From<&MailConfig> for SenderIdentity {
    fn from(config: &MailConfig) -> Self {
        Self {
            from_address: config.from_address.clone(),
            from_name: Some(config.from_name.clone()).filter(|n| !n.trim().is_empty()),
            reply_to: config.reply_to.clone(),
        }
    }
}

/// Sends one job's content to one recipient at a time and classifies failures.
///
/// Retries, rate limiting and bookkeeping belong to the caller.
#[derive(Clone)]
pub struct DispatchService {
    provider: Arc<dyn ProviderAdapter>,
    sender: SenderIdentity,
    timeout: Duration,
}

impl DispatchService {
    /// Create a dispatch service.
    pub fn new(provider: Arc<dyn ProviderAdapter>, sender: SenderIdentity, timeout: Duration) -> Self {
        Self {
            provider,
            sender,
            timeout,
        }
    }

    /// Create a dispatch service using the sender and timeout from `config`.
    pub fn from_config(provider: Arc<dyn ProviderAdapter>, config: &MailConfig) -> Self {
        Self::new(provider, SenderIdentity::from(config), config.request_timeout())
    }

    /// The active provider.
    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Build the provider message for one recipient of `job`.
    #[must_use]
    pub fn message_for(&self, job: &EmailJob, recipient: &Recipient) -> EmailMessage {
        EmailMessage {
            to: recipient.email.clone(),
            to_name: recipient.name.clone(),
            from_address: self.sender.from_address.clone(),
            from_name: self.sender.from_name.clone(),
            reply_to: self.sender.reply_to.clone(),
            subject: job.subject.clone(),
            html_body: job.html_content.clone(),
            text_body: job.text_content.clone(),
        }
    }

    /// Make exactly one delivery attempt to `recipient`.
    pub async fn send_one(
        &self,
        job: &EmailJob,
        recipient: &Recipient,
    ) -> Result<SendReceipt, DispatchError> {
        if !recipient.has_valid_email() {
            return Err(DispatchError::InvalidRecipient(format!(
                "malformed address: {}",
                recipient.email
            )));
        }

        let message = self.message_for(job, recipient);
        let result = match tokio::time::timeout(self.timeout, self.provider.send(&message)).await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::ProviderUnavailable(format!(
                "no response within {}s",
                self.timeout.as_secs_f64()
            ))),
        };

        match &result {
            Ok(receipt) => debug!(
                job_id = %job.id,
                recipient_id = %recipient.id,
                provider = %self.provider.kind(),
                message_id = ?receipt.provider_message_id,
                "Email sent"
            ),
            Err(e @ DispatchError::AuthenticationFailed(_)) => error!(
                job_id = %job.id,
                recipient_id = %recipient.id,
                provider = %self.provider.kind(),
                error = %e,
                "Provider rejected credentials; check the mail configuration"
            ),
            Err(e) => warn!(
                job_id = %job.id,
                recipient_id = %recipient.id,
                provider = %self.provider.kind(),
                error = %e,
                retryable = e.is_retryable(),
                "Email send failed"
            ),
        }

        result
    }

    /// Attempt every unresolved recipient of `job` once.
    ///
    /// Already resolved recipients keep their recorded result and are not
    /// sent again. A failure for one recipient never stops the others.
    pub async fn send_bulk(&self, job: &EmailJob) -> BTreeMap<String, RecipientResult> {
        self.sweep(job, || future::ready(None)).await.results
    }

    /// Like [`send_bulk`](Self::send_bulk), but asks `gate` before every send.
    ///
    /// Recipients never tried go before those that failed earlier. When the
    /// gate answers `Some(wait)` the pass stops and the remaining recipients
    /// keep their previous result.
    pub async fn sweep<G, F>(&self, job: &EmailJob, mut gate: G) -> BulkSweep
    where
        G: FnMut() -> F,
        F: Future<Output = Option<Duration>>,
    {
        let mut sweep = BulkSweep {
            results: job.per_recipient_result.clone(),
            ..BulkSweep::default()
        };
        for recipient in &job.recipients {
            sweep.results.entry(recipient.id.clone()).or_default();
        }

        for recipient in job.sweep_order() {
            if let Some(wait) = gate().await {
                sweep.halted = Some(wait);
                break;
            }

            sweep.attempted += 1;
            let result = match self.send_one(job, recipient).await {
                Ok(receipt) => RecipientResult::delivered(receipt.provider_message_id),
                Err(e) => {
                    if e.is_throttle() {
                        sweep.throttled = true;
                    } else if e.is_retryable() {
                        sweep.unavailable = true;
                    }
                    sweep.last_error = Some(e.to_string());
                    RecipientResult::failed(e.to_string(), !e.is_retryable())
                }
            };
            sweep.results.insert(recipient.id.clone(), result);
        }

        sweep
    }

    /// Check provider reachability and credentials.
    pub async fn verify_connection(&self) -> ConnectionCheck {
        self.provider.verify_connection().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{DEFAULT_MAX_ATTEMPTS, NewEmailJob};
    use crate::providers::{ScriptedOutcome, ScriptedProvider};
    use chrono::Utc;

    fn sender() -> SenderIdentity {
        SenderIdentity {
            from_address: "noreply@scholar.test".to_string(),
            from_name: Some("Scholar".to_string()),
            reply_to: Some("support@scholar.test".to_string()),
        }
    }

    fn job(recipients: &[(&str, &str)]) -> EmailJob {
        NewEmailJob {
            recipients: recipients
                .iter()
                .map(|(id, email)| Recipient::new(*id, *email, None))
                .collect(),
            subject: "Hello".to_string(),
            html_content: "<p>Hello</p>".to_string(),
            text_content: Some("Hello".to_string()),
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            template_id: None,
            template_data: None,
            scheduled_at: None,
        }
        .into_job("job1".to_string(), Utc::now())
    }

    fn service(provider: Arc<ScriptedProvider>) -> DispatchService {
        DispatchService::new(provider, sender(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_send_one_applies_sender_identity() {
        let provider = Arc::new(ScriptedProvider::new());
        let job = job(&[("a", "a@example.com")]);

        let receipt = service(Arc::clone(&provider))
            .send_one(&job, &job.recipients[0])
            .await
            .unwrap();

        assert!(receipt.provider_message_id.is_some());
        let sent = provider.accepted();
        assert_eq!(sent[0].from_address, "noreply@scholar.test");
        assert_eq!(sent[0].from_name.as_deref(), Some("Scholar"));
        assert_eq!(sent[0].reply_to.as_deref(), Some("support@scholar.test"));
        assert_eq!(sent[0].subject, "Hello");
    }

    #[tokio::test]
    async fn test_send_one_rejects_malformed_address_locally() {
        let provider = Arc::new(ScriptedProvider::new());
        let job = job(&[("a", "a@example.com")]);
        let bad = Recipient::new("b", "not an address", None);

        let err = service(Arc::clone(&provider))
            .send_one(&job, &bad)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidRecipient(_)));
        assert_eq!(provider.send_count(), 0);
    }

    #[tokio::test]
    async fn test_send_one_normalizes_errors() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_next("a@example.com", 503);
        provider.fail_next("a@example.com", 401);
        provider.fail_next("a@example.com", 429);
        provider.fail_next("a@example.com", 400);
        provider.push_outcome("a@example.com", ScriptedOutcome::Transport);
        let job = job(&[("a", "a@example.com")]);
        let svc = service(provider);
        let r = &job.recipients[0];

        assert!(matches!(
            svc.send_one(&job, r).await,
            Err(DispatchError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            svc.send_one(&job, r).await,
            Err(DispatchError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            svc.send_one(&job, r).await,
            Err(DispatchError::RateLimitedByProvider(_))
        ));
        assert!(matches!(
            svc.send_one(&job, r).await,
            Err(DispatchError::InvalidRecipient(_))
        ));
        assert!(matches!(
            svc.send_one(&job, r).await,
            Err(DispatchError::ProviderUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_one_times_out() {
        let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_secs(60)));
        let job = job(&[("a", "a@example.com")]);
        let svc = DispatchService::new(provider, sender(), Duration::from_secs(1));

        let err = svc.send_one(&job, &job.recipients[0]).await.unwrap_err();
        assert!(matches!(err, DispatchError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_send_bulk_isolates_failures() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("b@example.com", 400);
        let job = job(&[
            ("a", "a@example.com"),
            ("b", "b@example.com"),
            ("c", "c@example.com"),
        ]);

        let results = service(provider).send_bulk(&job).await;

        assert!(results["a"].sent);
        assert!(!results["b"].sent);
        assert!(results["b"].permanent);
        assert!(results["c"].sent);
    }

    #[tokio::test]
    async fn test_send_bulk_skips_resolved_recipients() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut job = job(&[("a", "a@example.com"), ("b", "b@example.com")]);
        job.per_recipient_result
            .insert("a".to_string(), RecipientResult::delivered(Some("m-1".into())));

        let results = service(Arc::clone(&provider)).send_bulk(&job).await;

        assert_eq!(provider.sends_to("a@example.com"), 0);
        assert_eq!(provider.sends_to("b@example.com"), 1);
        assert_eq!(results["a"].provider_message_id.as_deref(), Some("m-1"));
        assert!(results["b"].sent);
    }

    #[tokio::test]
    async fn test_sweep_stops_when_gate_closes() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("a@example.com", 503);
        let job = job(&[
            ("a", "a@example.com"),
            ("b", "b@example.com"),
            ("c", "c@example.com"),
        ]);

        let mut admitted = 0;
        let sweep = service(Arc::clone(&provider))
            .sweep(&job, || {
                admitted += 1;
                future::ready((admitted > 2).then_some(Duration::from_secs(42)))
            })
            .await;

        assert_eq!(sweep.attempted, 2);
        assert_eq!(sweep.halted, Some(Duration::from_secs(42)));
        assert!(sweep.unavailable);
        assert!(sweep.had_retryable_failure());
        assert!(sweep.results["b"].sent);
        assert_eq!(sweep.results["c"], RecipientResult::default());
        assert_eq!(sweep.unresolved(), 2);
        assert_eq!(provider.sends_to("c@example.com"), 0);
    }

    #[tokio::test]
    async fn test_sweep_tries_new_recipients_before_failed_ones() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut job = job(&[("a", "a@example.com"), ("b", "b@example.com")]);
        job.per_recipient_result
            .insert("a".to_string(), RecipientResult::failed("503".into(), false));

        let mut admitted = 0;
        let sweep = service(Arc::clone(&provider))
            .sweep(&job, || {
                admitted += 1;
                future::ready((admitted > 1).then_some(Duration::ZERO))
            })
            .await;

        assert!(sweep.results["b"].sent);
        assert!(!sweep.results["a"].sent);
        assert_eq!(provider.sends_to("a@example.com"), 0);
        assert!(!sweep.had_retryable_failure());
    }

    #[tokio::test]
    async fn test_sweep_flags_provider_throttling() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_outcome("a@example.com", ScriptedOutcome::Status(429));
        let job = job(&[("a", "a@example.com")]);

        let sweep = service(provider).sweep(&job, || future::ready(None)).await;

        assert!(sweep.throttled);
        assert!(!sweep.unavailable);
        assert!(sweep.halted.is_none());
        assert!(sweep.last_error.unwrap().contains("rate limited"));
    }
}
