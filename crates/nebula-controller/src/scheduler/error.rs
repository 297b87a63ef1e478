use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("scheduler returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("invalid scheduler endpoint {0}")]
    InvalidEndpoint(String),

    #[error("scheduler connections are closed")]
    Closed,
}

impl SchedulerError {
    /// Whether another attempt may succeed without any change on our side.
    ///
    /// Transport failures, 5xx and 429 are transient. Other 4xx responses,
    /// malformed endpoints and a closed connection pool are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Request(e) => {
                if let Some(status) = e.status() {
                    return status.is_server_error() || status.as_u16() == 429;
                }
                !(e.is_builder() || e.is_decode() || e.is_redirect())
            }
            SchedulerError::Status { status, .. } => *status >= 500 || *status == 429,
            SchedulerError::Unavailable(_) => true,
            SchedulerError::InvalidEndpoint(_) | SchedulerError::Closed => false,
        }
    }
}
