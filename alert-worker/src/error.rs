use alert_common::email::EmailError;
use alert_common::queue::QueueError;
use alert_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that can stop the worker from coming up. Once the
/// consumers are running the pipeline is fail-soft: per-event errors are
/// logged and counted, never propagated here.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred: {0}")]
    Store(#[from] StoreError),
    #[error("the slot queue is unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("the email transport could not be configured: {0}")]
    Email(#[from] EmailError),
}
