//! Error types for fragmend

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fragmend
#[derive(Error, Debug)]
pub enum Error {
    // Identifier errors
    #[error("Invalid fragment id: {0}")]
    InvalidFragmentId(String),

    #[error("Invalid backup id: {0}")]
    InvalidBackupId(String),

    #[error("Invalid version tag: {0}")]
    InvalidVersionTag(String),

    // Erasure map errors
    #[error("Unsupported supplier count: {0}")]
    UnsupportedSupplierCount(usize),

    #[error("Erasure map inconsistent: {0}")]
    InvalidEccMap(String),

    #[error("Block unrecoverable: {available} of {required} data segments recovered")]
    BlockUnrecoverable { available: usize, required: usize },

    // Block codec errors
    #[error("Block frame truncated: {got} bytes, need at least {need}")]
    FrameTruncated { got: usize, need: usize },

    #[error("Block frame corrupt: {0}")]
    FrameCorrupt(String),

    #[error("Fragment length mismatch: slot {slot} has {got} bytes, expected {expected}")]
    FragmentLengthMismatch {
        slot: usize,
        got: usize,
        expected: usize,
    },

    // Listing errors
    #[error("Listing parse error: {0}")]
    ListingParse(String),

    #[error("Listing from wrong supplier: line says {claimed}, ingesting into {actual}")]
    SupplierMismatch { claimed: usize, actual: usize },

    // Transfer errors
    #[error("Transfer shutting down")]
    TransferShutdown,

    // Worker pool errors
    #[error("Worker pool closed")]
    WorkerClosed,

    #[error("Task canceled: {0}")]
    TaskCanceled(String),

    // Restore errors
    #[error("Restore aborted: {0}")]
    RestoreAborted(String),

    #[error("Restore failed for {backup}: {reason}")]
    RestoreFailed { backup: String, reason: String },

    // Storage errors
    #[error("Fragment not found: {0}")]
    FragmentNotFound(String),

    // Engine errors
    #[error("Engine stopped")]
    EngineStopped,

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
