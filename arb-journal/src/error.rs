use thiserror::Error;

/// Failures the durability journal can raise. Every query-level one wraps the underlying
/// [`sqlx::Error`] rather than swallowing it, so an operator can see the actual Postgres
/// complaint in the logs.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize persisted state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
