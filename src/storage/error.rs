use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
