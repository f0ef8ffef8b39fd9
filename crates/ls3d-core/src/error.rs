//! Unified error handling for ls3d
//!
//! Codec errors live in `ls3d_parsers::ParseError` and are carried here as
//! [`Error::Codec`]. Everything the scene layer can raise on its own is a
//! variant of [`Error`].

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Vec3;

/// Unified error type for scene-level operations
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ==================== Codec Errors ====================

    /// Error raised by the binary codec
    #[error(transparent)]
    Codec(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Invalid data structure
    #[error("Invalid data: {message}")]
    InvalidData {
        message: String,
    },

    // ==================== Scene Errors ====================

    /// Armature joints disagree on scale
    #[error("Non-uniform armature scale in '{armature}': expected {expected:?}, found {found:?} on '{bone}'")]
    NonUniformScale {
        armature: String,
        bone: String,
        expected: Vec3,
        found: Vec3,
    },

    /// A name does not follow the pattern it is parsed with
    #[error("Malformed name '{name}': expected {expected}")]
    MalformedName {
        name: String,
        expected: &'static str,
    },

    /// A file referenced by the model is not on disk
    #[error("Missing resource '{name}' (searched {searched})")]
    MissingResource {
        name: String,
        searched: PathBuf,
    },

    /// A parent or bone reference that never resolved
    #[error("Invalid reference: {reference}")]
    InvalidReference {
        reference: String,
    },

    // ==================== General Errors ====================

    /// Custom error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type using the unified Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error with additional context
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Error::InvalidData {
            message: message.into(),
        }
    }

    /// Create an invalid reference error
    pub fn invalid_reference(reference: impl Into<String>) -> Self {
        Error::InvalidReference {
            reference: reference.into(),
        }
    }

    /// Errors after which the import carries on with a default.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::MalformedName { .. }
            | Error::MissingResource { .. }
            | Error::InvalidReference { .. }
            | Error::NonUniformScale { .. } => true,
            Error::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a "not found" type error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::FileNotFound(_) | Error::MissingResource { .. } => true,
            Error::WithContext { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
