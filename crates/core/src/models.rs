//! Email job domain model.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::JobValidationError;

/// Job identifier (lower-case ULID).
pub type JobId = String;

/// Default attempt budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A single addressee of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Recipient {
    /// Caller-assigned id, unique within the job.
    #[validate(length(min = 1))]
    pub id: String,
    /// Delivery address.
    #[validate(email)]
    pub email: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Recipient {
    /// Create a recipient.
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name,
        }
    }

    /// Whether the address is syntactically valid.
    #[must_use]
    pub fn has_valid_email(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Delivery result for one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientResult {
    /// The provider accepted the message for this recipient.
    pub sent: bool,
    /// Message id assigned by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    /// Last error seen for this recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure will not go away by retrying.
    #[serde(default)]
    pub permanent: bool,
}

impl RecipientResult {
    /// A successful delivery.
    #[must_use]
    pub const fn delivered(provider_message_id: Option<String>) -> Self {
        Self {
            sent: true,
            provider_message_id,
            error: None,
            permanent: false,
        }
    }

    /// A failed delivery.
    #[must_use]
    pub const fn failed(error: String, permanent: bool) -> Self {
        Self {
            sent: false,
            provider_message_id: None,
            error: Some(error),
            permanent,
        }
    }

    /// Sent, or failed for good. Resolved recipients are never sent again.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.sent || self.permanent
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Some recipients were sent, the rest failed for good.
    PartiallySent,
    /// Every recipient was sent.
    Sent,
    /// No recipient was sent.
    Failed,
    /// Withdrawn before pickup.
    Cancelled,
}

impl JobStatus {
    /// Whether the job will never be processed again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PartiallySent | Self::Sent | Self::Failed | Self::Cancelled
        )
    }

    /// Final status for a finished sweep over `results`.
    #[must_use]
    pub fn from_results(results: &BTreeMap<String, RecipientResult>) -> Self {
        let sent = results.values().filter(|r| r.sent).count();
        if sent == results.len() {
            Self::Sent
        } else if sent == 0 {
            Self::Failed
        } else {
            Self::PartiallySent
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::PartiallySent => "PARTIALLY_SENT",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A queued email and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    /// Assigned at enqueue.
    pub id: JobId,
    /// Addressees, in submission order.
    pub recipients: Vec<Recipient>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html_content: String,
    /// Plain text body.
    pub text_content: Option<String>,
    /// Template the content was rendered from. Audit only.
    pub template_id: Option<String>,
    /// Data the template was rendered with. Audit only.
    pub template_data: Option<serde_json::Value>,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Delivery passes used so far.
    pub attempts: u32,
    /// Delivery passes allowed before the job is finished as is.
    pub max_attempts: u32,
    /// Times the local send rate limit pushed the job back.
    pub deferrals: u32,
    /// Times provider throttling pushed the job back. Bounded by the retry policy.
    #[serde(default)]
    pub throttle_deferrals: u32,
    /// Earliest time a worker may claim the job.
    pub scheduled_at: DateTime<Utc>,
    /// Recipient id to delivery result, one entry per recipient.
    pub per_recipient_result: BTreeMap<String, RecipientResult>,
    /// Worker holding the current claim.
    pub claimed_by: Option<String>,
    /// Token of the current claim.
    pub lease_id: Option<Uuid>,
    /// When the current claim expires and may be reaped.
    pub visibility_deadline: Option<DateTime<Utc>>,
    /// Last failure recorded on the job.
    pub last_error: Option<String>,
    /// Enqueue time; breaks priority ties.
    pub created_at: DateTime<Utc>,
    /// Start of the most recent claim.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set once the job reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl EmailJob {
    /// Recipients that still need a delivery attempt, in submission order.
    pub fn unresolved_recipients(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(|r| {
            self.per_recipient_result
                .get(&r.id)
                .is_none_or(|result| !result.is_resolved())
        })
    }

    /// Unresolved recipients with those never tried ahead of those that
    /// already failed, otherwise in submission order.
    #[must_use]
    pub fn sweep_order(&self) -> Vec<&Recipient> {
        let (untried, retried): (Vec<_>, Vec<_>) = self.unresolved_recipients().partition(|r| {
            self.per_recipient_result
                .get(&r.id)
                .is_none_or(|result| result.error.is_none())
        });
        untried.into_iter().chain(retried).collect()
    }

    /// Whether another attempt fits in the budget after the current one.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }
}

/// Everything needed to create a job. Content is already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmailJob {
    /// At least one, with unique ids.
    pub recipients: Vec<Recipient>,
    /// Subject line, not empty.
    pub subject: String,
    /// HTML body.
    pub html_content: String,
    /// Plain text body.
    pub text_content: Option<String>,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Attempt budget, at least 1.
    pub max_attempts: u32,
    /// Template the content came from. Audit only.
    pub template_id: Option<String>,
    /// Data the template was rendered with. Audit only.
    pub template_data: Option<serde_json::Value>,
    /// Earliest pickup time; now when absent.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewEmailJob {
    /// Check the structural invariants a job must satisfy before it is stored.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.recipients.is_empty() {
            return Err(JobValidationError::NoRecipients);
        }

        let mut seen = HashSet::with_capacity(self.recipients.len());
        for recipient in &self.recipients {
            if recipient.id.is_empty() {
                return Err(JobValidationError::EmptyRecipientId);
            }
            if !seen.insert(recipient.id.as_str()) {
                return Err(JobValidationError::DuplicateRecipient(recipient.id.clone()));
            }
            if !recipient.has_valid_email() {
                return Err(JobValidationError::InvalidEmail {
                    recipient_id: recipient.id.clone(),
                    email: recipient.email.clone(),
                });
            }
        }

        if self.subject.trim().is_empty() {
            return Err(JobValidationError::EmptySubject);
        }
        let has_text = self.text_content.as_ref().is_some_and(|t| !t.trim().is_empty());
        if self.html_content.trim().is_empty() && !has_text {
            return Err(JobValidationError::MissingContent);
        }
        if self.max_attempts == 0 {
            return Err(JobValidationError::NoAttempts);
        }

        Ok(())
    }

    /// Build the pending job with empty per-recipient results.
    #[must_use]
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> EmailJob {
        let per_recipient_result = self
            .recipients
            .iter()
            .map(|r| (r.id.clone(), RecipientResult::default()))
            .collect();

        EmailJob {
            id,
            recipients: self.recipients,
            subject: self.subject,
            html_content: self.html_content,
            text_content: self.text_content,
            template_id: self.template_id,
            template_data: self.template_data,
            priority: self.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            deferrals: 0,
            throttle_deferrals: 0,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            per_recipient_result,
            claimed_by: None,
            lease_id: None,
            visibility_deadline: None,
            last_error: None,
            created_at: now,
            last_attempt_at: None,
            completed_at: None,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting for a worker.
    pub pending: u64,
    /// Claimed and in flight.
    pub processing: u64,
    /// Delivered to every recipient.
    pub sent: u64,
    /// Delivered to nobody.
    pub failed: u64,
    /// Delivered to some recipients.
    pub partially_sent: u64,
    /// Withdrawn before pickup.
    pub cancelled: u64,
}

impl QueueStats {
    /// Add one job in `status`.
    pub const fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Sent => self.sent += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::PartiallySent => self.partially_sent += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Total jobs counted.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending
            + self.processing
            + self.sent
            + self.failed
            + self.partially_sent
            + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(recipients: Vec<Recipient>) -> NewEmailJob {
        NewEmailJob {
            recipients,
            subject: "Hello".to_string(),
            html_content: "<p>Hi</p>".to_string(),
            text_content: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            template_id: None,
            template_data: None,
            scheduled_at: None,
        }
    }

    fn recipient(id: &str, email: &str) -> Recipient {
        Recipient::new(id, email, None)
    }

    #[test]
    fn test_validate_accepts_well_formed_job() {
        let job = new_job(vec![
            recipient("a", "a@example.com"),
            recipient("b", "b@example.com"),
        ]);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_structural_problems() {
        assert_eq!(new_job(vec![]).validate(), Err(JobValidationError::NoRecipients));

        let dup = new_job(vec![
            recipient("a", "a@example.com"),
            recipient("a", "b@example.com"),
        ]);
        assert_eq!(
            dup.validate(),
            Err(JobValidationError::DuplicateRecipient("a".to_string()))
        );

        let bad = new_job(vec![recipient("a", "not-an-address")]);
        assert!(matches!(
            bad.validate(),
            Err(JobValidationError::InvalidEmail { .. })
        ));

        let mut no_subject = new_job(vec![recipient("a", "a@example.com")]);
        no_subject.subject = "  ".to_string();
        assert_eq!(no_subject.validate(), Err(JobValidationError::EmptySubject));

        let mut no_content = new_job(vec![recipient("a", "a@example.com")]);
        no_content.html_content = String::new();
        assert_eq!(no_content.validate(), Err(JobValidationError::MissingContent));
        no_content.text_content = Some("plain".to_string());
        assert!(no_content.validate().is_ok());
    }

    #[test]
    fn test_into_job_initializes_results() {
        let now = Utc::now();
        let job = new_job(vec![
            recipient("a", "a@example.com"),
            recipient("b", "b@example.com"),
        ])
        .into_job("job1".to_string(), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.scheduled_at, now);
        assert_eq!(job.per_recipient_result.len(), 2);
        assert!(job.per_recipient_result.values().all(|r| !r.sent));
        assert_eq!(job.unresolved_recipients().count(), 2);
    }

    #[test]
    fn test_unresolved_skips_sent_and_permanent() {
        let mut job = new_job(vec![
            recipient("a", "a@example.com"),
            recipient("b", "b@example.com"),
            recipient("c", "c@example.com"),
        ])
        .into_job("job1".to_string(), Utc::now());
        job.per_recipient_result
            .insert("a".to_string(), RecipientResult::delivered(Some("m1".into())));
        job.per_recipient_result
            .insert("b".to_string(), RecipientResult::failed("rejected".into(), true));

        let ids: Vec<_> = job.unresolved_recipients().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_sweep_order_puts_untried_first() {
        let mut job = new_job(vec![
            recipient("a", "a@example.com"),
            recipient("b", "b@example.com"),
            recipient("c", "c@example.com"),
            recipient("d", "d@example.com"),
        ])
        .into_job("job1".to_string(), Utc::now());
        job.per_recipient_result
            .insert("a".to_string(), RecipientResult::failed("503".into(), false));
        job.per_recipient_result
            .insert("b".to_string(), RecipientResult::delivered(None));

        let ids: Vec<_> = job.sweep_order().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a"]);
    }

    #[test]
    fn test_status_from_results() {
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), RecipientResult::delivered(None));
        assert_eq!(JobStatus::from_results(&results), JobStatus::Sent);

        results.insert("b".to_string(), RecipientResult::failed("x".into(), true));
        assert_eq!(JobStatus::from_results(&results), JobStatus::PartiallySent);

        results.remove("a");
        assert_eq!(JobStatus::from_results(&results), JobStatus::Failed);
    }

    #[test]
    fn test_status_serializes_upper_snake() {
        let json = serde_json::to_string(&JobStatus::PartiallySent).unwrap_or_default();
        assert_eq!(json, "\"PARTIALLY_SENT\"");
        assert_eq!(JobStatus::PartiallySent.to_string(), "PARTIALLY_SENT");
    }
}
