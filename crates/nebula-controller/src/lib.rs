//! Control plane that keeps the desired-state store, the scheduler and the
//! proxy route configuration consistent.

pub mod classify;
pub mod command;
pub mod connection;
pub mod finalizer;
pub mod metrics;
pub mod pipeline_sync;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod server_sync;
pub mod status;

#[cfg(test)]
mod testing;

pub use command::{CommandClient, CommandError};
pub use connection::{ConnectionManager, Connector, HttpConnector, HttpConnectorConfig};
pub use metrics::{admin_router, AdminState, SyncMetrics};
pub use pipeline_sync::PipelineStatusSync;
pub use reconcile::DesiredStateReconciler;
pub use retry::{ConflictRetry, RetryConfig};
pub use server_sync::ServerStatusSync;
pub use status::{EventOutcome, SyncContext};
