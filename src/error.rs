use thiserror::Error;

/// Errors surfaced by the pool core.
///
/// Synchronous setup failures (configuration, placeholder parsing, parameter
/// binding, queue capacity) are returned to the caller immediately; failures
/// that happen after a query has been handed to a connection flow back through
/// the awaiter and surface when the wait-handle is awaited.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Placeholder parse error: {0}")]
    Parse(String),

    #[error("Parameter count mismatch; expected {expected}, got {got}")]
    ParameterCountMismatch { expected: usize, got: usize },

    #[error("Missing bound parameter: {0}")]
    MissingParameter(String),

    #[error("Pool queue size exceeded")]
    QueueFull,

    #[error("Transactional queue size exceeded")]
    TransactionQueueFull,

    #[error("Query canceled")]
    Canceled,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Pool handle has been released")]
    HandleReleased,
}
