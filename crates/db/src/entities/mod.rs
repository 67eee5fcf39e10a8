//! Database entities.

#![allow(missing_docs)]

pub mod email_job;

pub use email_job::Entity as EmailJob;
