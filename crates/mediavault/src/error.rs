use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum MediaVaultError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Duplicate detection error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid root entry '{entry}': {reason}")]
    InvalidRootEntry { entry: String, reason: String },

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("No database path configured and no home directory available")]
    MissingDatabasePath,
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The persistent store rejected a read or write.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(#[from] DatabaseError),

    #[error("No handler registered for job type '{0}'")]
    UnknownJobType(String),

    #[error("Handlers cannot be registered after the scheduler has started")]
    AlreadyStarted,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} cannot be modified while {status}")]
    InvalidState { id: String, status: String },

    #[error("Failed to serialize job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Unknown root key '{0}'")]
    UnknownRoot(String),

    #[error("Watch root '{path}' is not accessible: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid exclude pattern '{pattern}': {source}")]
    InvalidExclude {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Failed to queue ingestion job: {0}")]
    Queue(#[from] QueueError),

    #[error("Filesystem scan task failed: {0}")]
    ScanTask(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame sampling failed for '{path}': {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cannot ignore a pair of the same record ({0})")]
    InvalidPair(i64),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

/// Failure reported by a job handler.
///
/// Only the message is persisted, so handlers convert whatever went wrong
/// into text at the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("invalid payload: {}", e))
    }
}

impl From<HashError> for HandlerError {
    fn from(e: HashError) -> Self {
        Self(e.to_string())
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        Self(e.to_string())
    }
}

impl From<DatabaseError> for HandlerError {
    fn from(e: DatabaseError) -> Self {
        Self(e.to_string())
    }
}

impl From<DedupError> for HandlerError {
    fn from(e: DedupError) -> Self {
        Self(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MediaVaultError>;
