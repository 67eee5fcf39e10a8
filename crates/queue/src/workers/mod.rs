//! Email workers and the pool that runs them.

mod email;
mod pool;

pub use email::{EmailWorker, JobResolution};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
