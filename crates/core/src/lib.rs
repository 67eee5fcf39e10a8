//! Email domain model, provider adapters and dispatch for the scholar mail pipeline.
//!
//! - [`models`]: jobs, recipients and per-recipient results
//! - [`providers`]: the [`ProviderAdapter`](providers::ProviderAdapter) trait,
//!   the `SendGrid` and SES adapters, and [`ProviderFactory`](providers::ProviderFactory)
//! - [`services`]: [`DispatchService`](services::DispatchService), one attempt per recipient
//! - [`templates`]: built-in transactional templates

pub mod error;
pub mod models;
pub mod providers;
pub mod services;
pub mod templates;

pub use error::{ConfigurationError, DispatchError, JobValidationError, ProviderError};
pub use models::{
    DEFAULT_MAX_ATTEMPTS, EmailJob, JobId, JobStatus, NewEmailJob, QueueStats, Recipient,
    RecipientResult,
};
pub use services::{BulkSweep, DispatchService, SenderIdentity};
pub use templates::{BuiltinTemplates, RenderedTemplate, TemplateCatalog};
