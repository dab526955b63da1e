use thiserror::Error;

/// A report execution failed. Recorded on the run; the schedule still advances.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// The email hand-off failed after a successful run.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// Caching or rendering a finished result failed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExportError(pub String);

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A schedule definition is missing fields required by its kind, or
    /// carries values outside their range.
    #[error("Malformed schedule definition: {0}")]
    MalformedDefinition(String),

    /// The timezone name is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Report execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Another worker claimed or advanced the schedule first.
    #[error("Schedule {schedule_id} was modified concurrently")]
    ConcurrentModification { schedule_id: String },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Report not found: {id}")]
    ReportNotFound { id: String },

    /// A stored JSON column could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// True for failures of the schedule store itself. These are the only
    /// errors that stop the worker loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::Database(_))
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, SchedulerError::ConcurrentModification { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
