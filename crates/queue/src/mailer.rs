//! Submission and status API used by the rest of the platform.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scholar_core::{
    EmailJob, JobId, NewEmailJob, QueueStats, Recipient, RenderedTemplate, TemplateCatalog,
};
use serde_json::Value;
use tracing::info;

use crate::retry::RetryPolicy;
use crate::store::{QueueError, QueueStore};

/// A send request.
///
/// With `template_id` set, subject and content are rendered from the
/// catalog; a non-empty `subject` still overrides the template's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitEmail {
    /// Addressees; one job covers all of them.
    pub recipients: Vec<Recipient>,
    /// Subject line. Empty means "use the template's".
    pub subject: String,
    /// HTML body, ignored when rendering from a template.
    pub html_content: String,
    /// Plain text body.
    pub text_content: Option<String>,
    /// Claim priority, higher first. Defaults to 0.
    pub priority: Option<i32>,
    /// Catalog template to render.
    pub template_id: Option<String>,
    /// Values substituted into the template.
    pub template_data: Option<Value>,
    /// Earliest send time. Defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Attempt budget. Defaults to the retry policy's.
    pub max_attempts: Option<u32>,
}

impl SubmitEmail {
    /// A request with pre-rendered content.
    pub fn new(
        recipients: Vec<Recipient>,
        subject: impl Into<String>,
        html_content: impl Into<String>,
    ) -> Self {
        Self {
            recipients,
            subject: subject.into(),
            html_content: html_content.into(),
            ..Default::default()
        }
    }

    /// A request rendered from a template.
    pub fn from_template(
        recipients: Vec<Recipient>,
        template_id: impl Into<String>,
        template_data: Value,
    ) -> Self {
        Self {
            recipients,
            template_id: Some(template_id.into()),
            template_data: Some(template_data),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Entry point for enqueueing mail and reading back its status.
///
/// Submission returns as soon as the job is stored; delivery results are
/// only visible through [`MailQueue::get_job`].
#[derive(Clone)]
pub struct MailQueue {
    store: Arc<dyn QueueStore>,
    templates: Arc<dyn TemplateCatalog>,
    default_max_attempts: u32,
}

impl MailQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        templates: Arc<dyn TemplateCatalog>,
        retry: &RetryPolicy,
    ) -> Self {
        Self {
            store,
            templates,
            default_max_attempts: retry.max_attempts,
        }
    }

    /// Enqueue one email, returning the job id.
    pub async fn submit(&self, request: SubmitEmail) -> Result<JobId, QueueError> {
        let job = self.store.enqueue(self.prepare(request)?).await?;
        info!(
            job_id = %job.id,
            recipients = job.recipients.len(),
            priority = job.priority,
            template = job.template_id.as_deref().unwrap_or("-"),
            "Email job submitted"
        );
        Ok(job.id)
    }

    /// Enqueue one email to many recipients as a single job.
    pub async fn submit_bulk(&self, request: SubmitEmail) -> Result<JobId, QueueError> {
        self.submit(request).await
    }

    /// Snapshot of a job, including per-recipient results.
    pub async fn get_job(&self, id: &str) -> Result<EmailJob, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Job counts per status.
    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }

    /// Cancel a job that no worker has picked up yet.
    pub async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            info!(job_id = %id, "Email job cancelled");
        }
        Ok(cancelled)
    }

    fn prepare(&self, request: SubmitEmail) -> Result<NewEmailJob, QueueError> {
        let SubmitEmail {
            recipients,
            mut subject,
            mut html_content,
            mut text_content,
            priority,
            template_id,
            template_data,
            scheduled_at,
            max_attempts,
        } = request;

        if let Some(id) = &template_id {
            let data = template_data.clone().unwrap_or(Value::Object(Default::default()));
            let RenderedTemplate { subject: s, text, html } = self.templates.render(id, &data)?;
            if subject.trim().is_empty() {
                subject = s;
            }
            html_content = html;
            text_content = Some(text);
        }

        Ok(NewEmailJob {
            recipients,
            subject,
            html_content,
            text_content,
            priority: priority.unwrap_or_default(),
            max_attempts: max_attempts.unwrap_or(self.default_max_attempts),
            template_id,
            template_data,
            scheduled_at,
        })
    }
}
