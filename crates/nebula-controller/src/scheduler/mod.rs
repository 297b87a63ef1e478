//! Client side of the scheduler service.

mod api;
mod error;
mod http;

pub use api::{PipelineStatusStream, SchedulerApi, ServerStatusStream};
pub use error::SchedulerError;
pub use http::{decode_ndjson, HttpScheduler};
