use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Errors that can originate from sqlx, wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
}

impl StoreError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::Query {
            command: command.to_owned(),
            error,
        }
    }
}

/// Open a connection pool with the operation deadline every store call
/// inherits through acquire.
pub async fn connect_pool(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .map_err(|error| StoreError::Connection { error })
}
