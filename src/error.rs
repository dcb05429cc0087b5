// src/error.rs

//! Error types for condawheel
//!
//! One error enum covers the whole conversion engine. Whether an error
//! aborts a dependency tree or only the node it happened on is decided by
//! [`Error::is_tree_fatal`].

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reading, converting, resolving or writing artifacts
#[derive(Error, Debug)]
pub enum Error {
    /// Extension and signature do not match any supported source format
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchiveFormat(String),

    /// The archive was recognised but could not be extracted
    #[error("Corrupt archive '{path}': {reason}")]
    CorruptArchive { path: String, reason: String },

    /// The package metadata file is absent or unparsable
    #[error("Missing or invalid package metadata in '{path}': {reason}")]
    MissingMetadata { path: String, reason: String },

    /// The binary rewrite collaborator could not update a search path
    #[error("Failed to relink '{path}': {reason}")]
    RelinkFailed { path: String, reason: String },

    /// No package matched the requested reference on any allowed subdir
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Local filesystem failure while producing output
    #[error("Write error: {0}")]
    WriteError(String),

    /// Fetching a remote artifact or index failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Downloaded content does not match the advertised digest
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A required external tool is not on PATH
    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A dependency name has no verified counterpart in the target index
    #[error("Dependency '{0}' does not exist in the target index")]
    UntranslatedDependency(String),

    /// An archive entry tried to escape its extraction root
    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    /// Path is empty or otherwise unusable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must abort the whole tree even when it happens
    /// on a non-root dependency.
    ///
    /// Data problems (bad archive, missing package, relink failure) stay
    /// local to their node. Local environment problems do not.
    pub fn is_tree_fatal(&self) -> bool {
        matches!(self, Self::WriteError(_) | Self::Io(_))
    }

    /// Build a [`Error::WriteError`] from any displayable cause
    pub fn write(context: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        Self::WriteError(format!("{}: {}", context, cause))
    }
}
