//! Error types for the Bellows core library.

use thiserror::Error;

/// Core error type for the Bellows master.
#[derive(Error, Debug)]
pub enum BellowsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Date parsing error in {field}: {message}")]
    DateParse {
        field: &'static str,
        message: String,
    },

    /// An atomic partial update matched no stored row. Processing
    /// functions translate this into a `false` return instead of
    /// corrupting the aggregate.
    #[error("Stale update: {0}")]
    StaleUpdate(String),

    /// The build is already in a terminal status and cannot be cancelled.
    #[error("Build cannot be cancelled from its current status")]
    ImpossibleCancellation,

    #[error("Wire protocol error: {0}")]
    Client(String),

    /// The peer answered a request with an empty frame. This is what a
    /// TLS-enabled server looks like when contacted in plain mode.
    #[error("Bad connection: {0}")]
    BadConnection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Malformed build config: {0}")]
    BadBuildConfig(String),

    #[error("Secrets retrieval failed: {0}")]
    Secrets(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Instance error: {0}")]
    Instance(String),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Buildset not found: {0}")]
    BuildSetNotFound(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Build step not found: {0}")]
    BuildStepNotFound(String),

    #[error("Slave not found: {0}")]
    SlaveNotFound(String),

    #[error("Builder not found: {0}")]
    BuilderNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid ID: {0}")]
    InvalidId(#[from] ulid::DecodeError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Result type alias for Bellows operations.
pub type Result<T> = std::result::Result<T, BellowsError>;
