use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while walking or building the chunk tree shared by
/// iTunesDB and ArtworkDB.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("unknown chunk tag {tag:?} at offset {offset}")]
    InvalidMagic { tag: [u8; 4], offset: usize },
    #[error("chunk at offset {offset} claims total_len {total_len} but buffer is only {buf_len} bytes")]
    TruncatedChunk { offset: usize, total_len: usize, buf_len: usize },
    #[error("chunk at offset {offset} has header_len {header_len} > total_len {total_len}")]
    InconsistentLengths { offset: usize, header_len: usize, total_len: usize },
}

/// Errors raised by the HASH58/HASH72 checksum engine.
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("device uses an unsupported checksum scheme (HASHAB): {0}")]
    UnsupportedDevice(String),
    #[error("HASH72 is required for this device but no reference database has ever been captured; first sync a clean database with iTunes to provide a signable reference")]
    HashKeyUnavailable,
}

/// Errors raised by the fingerprint differ.
#[derive(Debug, Error)]
pub enum DifferError {
    #[error("acoustic fingerprint tool not found on PATH")]
    FingerprintToolMissing,
    #[error("I/O error scanning PC library: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the sync executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("insufficient space on device: need {needed} bytes, have {available} bytes free")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("source file missing: {0}")]
    SourceFileMissing(PathBuf),
    #[error("transcode failed for {path}: {reason}")]
    TranscodeFailed { path: PathBuf, reason: String },
    #[error("failed to write database: {0}")]
    DatabaseWriteFailed(String),
    #[error("sync cancelled")]
    Cancelled,
}

/// Crate-wide error, composed from the per-subsystem taxonomies above plus
/// whatever the chunk codec and checksum engine raise. CLI-facing call sites
/// wrap this in `anyhow::Error` and attach `.context(...)`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Differ(#[from] DifferError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("invalid database layout: {0}")]
    InvalidDatabaseLayout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
