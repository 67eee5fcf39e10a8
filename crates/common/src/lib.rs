//! Common utilities and shared types for the scholar mail pipeline.
//!
//! This crate provides foundational components used across all scholar crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use scholar_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     println!("{} workers, first job id {}", config.queue.workers, id_gen.generate());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;

pub use config::{
    Config, DatabaseConfig, MailConfig, QueueSettings, RateLimitSettings, RedisConfig,
    RetrySettings,
};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
