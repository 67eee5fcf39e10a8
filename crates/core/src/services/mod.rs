//! Delivery services.

pub mod dispatch;

pub use dispatch::{BulkSweep, DispatchService, SenderIdentity};
