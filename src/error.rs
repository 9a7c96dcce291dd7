use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Pipeline-wide error taxonomy.
///
/// Only a bad volume signature or the initial open/boot-sector read aborts a
/// scan. Every other variant degrades the record, chain, or candidate it
/// touched and the scan keeps going.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupted metadata: {0}")]
    CorruptMetadata(String),
    #[error("Cycle detected at allocation unit {0}")]
    CycleDetected(u64),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
