use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read key {key}: {source}")]
    Read { key: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

    #[error("failed to write key {key}: {source}")]
    Write { key: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

    #[error("failed to delete key {key}: {source}")]
    Delete { key: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

    #[error("failed to list prefix {prefix}: {source}")]
    List { prefix: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}
