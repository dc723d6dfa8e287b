//! Publisher, embedder worker and maintenance loop over the core capability traits.

pub mod daemon;
pub mod publisher;
pub mod retry;
pub mod worker;

pub use daemon::{Maintainer, MaintainerOptions, TickReport};
pub use publisher::{new_run_id, PublishReport, Publisher};
pub use retry::RetryPolicy;
pub use worker::{BatchReport, EmbedderWorker, WorkerOptions};
