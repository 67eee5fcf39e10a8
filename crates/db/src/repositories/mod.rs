//! Database repositories.

pub mod email_job;

pub use email_job::{EmailJobRepository, LeaseCounter};
